//! Versioned, self-describing archive of named entries.
//!
//! On disk:
//!
//! ```text
//! +--------+-----------+------------------------+---------------------------+
//! | "CMPZ" | toc_len   | table of contents      | payloads                  |
//! | 4 B    | u32 LE    | bincode Vec<EntryHeader> | one zstd frame per entry |
//! +--------+-----------+------------------------+---------------------------+
//! ```
//!
//! Every entry is compressed independently, so looking up one key inflates
//! only that key's frame. The `compz_info` entry carries
//! `[format_version, bit_width]`.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use bincode::Options;
use memmap2::Mmap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::{compress_zstd, decompress_zstd, MAX_INFLATION};
use crate::error::{Error, Result};
use crate::format::BIT_WIDTH;

/// File magic.
pub const MAGIC: &[u8; 4] = b"CMPZ";
/// Archive format version written by this build; the only one it reads.
pub const FORMAT_VERSION: i64 = 1;
/// Key of the header entry.
pub const INFO_KEY: &str = "compz_info";
/// Upper bound on the table of contents size accepted by the reader.
const MAX_TOC_BYTES: u64 = 256 * 1024 * 1024;

/// A single archive value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Integer sequence (the header).
    Ints(Vec<i64>),
    /// Single integer (a layer's fractional bits).
    Scalar(i64),
    /// Flattened int8 tensor.
    Int8(Vec<i8>),
}

/// Value type recorded in the table of contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Ints,
    Scalar,
    Int8,
}

impl EntryKind {
    fn element_size(self) -> u64 {
        match self {
            EntryKind::Ints | EntryKind::Scalar => 8,
            EntryKind::Int8 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Ints => "ints",
            EntryKind::Scalar => "scalar",
            EntryKind::Int8 => "int8",
        }
    }
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Ints(_) => EntryKind::Ints,
            Entry::Scalar(_) => EntryKind::Scalar,
            Entry::Int8(_) => EntryKind::Int8,
        }
    }

    pub fn elements(&self) -> usize {
        match self {
            Entry::Ints(v) => v.len(),
            Entry::Scalar(_) => 1,
            Entry::Int8(v) => v.len(),
        }
    }

    fn to_raw(&self) -> Vec<u8> {
        match self {
            Entry::Ints(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Entry::Scalar(v) => v.to_le_bytes().to_vec(),
            Entry::Int8(values) => values.iter().map(|&v| v as u8).collect(),
        }
    }

    fn from_raw(kind: EntryKind, raw: &[u8]) -> Self {
        let ints = || {
            raw.chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        };
        match kind {
            EntryKind::Ints => Entry::Ints(ints().collect()),
            EntryKind::Scalar => Entry::Scalar(ints().next().unwrap_or_default()),
            EntryKind::Int8 => Entry::Int8(raw.iter().map(|&b| b as i8).collect()),
        }
    }
}

/// Table of contents record for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub key: String,
    pub kind: EntryKind,
    pub elements: u64,
    /// Offset of the zstd frame from the start of the payload section.
    pub offset: u64,
    pub stored_len: u64,
}

impl EntryHeader {
    fn raw_len(&self) -> Option<u64> {
        self.elements.checked_mul(self.kind.element_size())
    }
}

/// Archive header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub format_version: i64,
    pub bit_width: i64,
}

impl Default for ArchiveInfo {
    fn default() -> Self {
        ArchiveInfo {
            format_version: FORMAT_VERSION,
            bit_width: BIT_WIDTH as i64,
        }
    }
}

fn toc_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(limit)
}

/// Append-only builder for an archive.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    entries: Vec<(String, Entry)>,
    keys: HashSet<String>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer pre-populated with the header entry for `info`.
    pub fn with_info(info: ArchiveInfo) -> Self {
        let mut writer = Self::new();
        writer.keys.insert(INFO_KEY.to_string());
        writer.entries.push((
            INFO_KEY.to_string(),
            Entry::Ints(vec![info.format_version, info.bit_width]),
        ));
        writer
    }

    /// Add an entry. Keys are unique within an archive.
    pub fn insert(&mut self, key: impl Into<String>, entry: Entry) -> Result<()> {
        let key = key.into();
        if !self.keys.insert(key.clone()) {
            return Err(Error::DuplicateKey(key));
        }
        self.entries.push((key, entry));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| e)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Serialize the whole archive.
    pub fn to_bytes(&self, level: i32) -> Result<Vec<u8>> {
        let frames: Vec<Vec<u8>> = self
            .entries
            .par_iter()
            .map(|(_, entry)| compress_zstd(&entry.to_raw(), level))
            .collect::<Result<_>>()?;

        let mut toc = Vec::with_capacity(self.entries.len());
        let mut offset = 0u64;
        for ((key, entry), frame) in self.entries.iter().zip(&frames) {
            toc.push(EntryHeader {
                key: key.clone(),
                kind: entry.kind(),
                elements: entry.elements() as u64,
                offset,
                stored_len: frame.len() as u64,
            });
            offset += frame.len() as u64;
        }

        let toc_bytes = toc_options(MAX_TOC_BYTES).serialize(&toc)?;
        let toc_len = u32::try_from(toc_bytes.len())
            .map_err(|_| Error::Serialization("table of contents exceeds 4 GiB".into()))?;

        let mut out = Vec::with_capacity(8 + toc_bytes.len() + offset as usize);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&toc_len.to_le_bytes());
        out.extend_from_slice(&toc_bytes);
        for frame in &frames {
            out.extend_from_slice(frame);
        }

        debug!(
            entries = self.entries.len(),
            bytes = out.len(),
            "serialized archive"
        );
        Ok(out)
    }

    /// Write the archive to `path`, returning the number of bytes written.
    ///
    /// Data goes to a sibling temporary file first and is renamed into place,
    /// so `path` never holds a partial archive.
    pub fn write_to(&self, path: &Path, level: i32) -> Result<usize> {
        let bytes = self.to_bytes(level)?;
        let tmp = tmp_path(path);
        if let Err(e) = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %path.display(), bytes = bytes.len(), "wrote archive");
        Ok(bytes.len())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => &m[..],
            Backing::Owned(v) => &v[..],
        }
    }
}

/// Read-only view of an archive with lookup by key.
pub struct ArchiveReader {
    bytes: Backing,
    toc: Vec<EntryHeader>,
    index: HashMap<String, usize>,
    payload_start: usize,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("entries", &self.toc.len())
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl ArchiveReader {
    /// Parse an in-memory archive.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::with_backing(Backing::Owned(bytes))
    }

    /// Memory-map and parse the archive at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        debug!(path = %path.display(), bytes = mmap.len(), "mapped archive");
        Self::with_backing(Backing::Mapped(mmap))
    }

    fn with_backing(bytes: Backing) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::corrupted("archive shorter than its preamble"));
        }
        if &bytes[..4] != MAGIC {
            return Err(Error::corrupted("bad magic"));
        }

        let toc_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let payload_start = 8usize
            .checked_add(toc_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Error::corrupted("table of contents runs past end of file"))?;

        let toc: Vec<EntryHeader> = toc_options(toc_len as u64)
            .deserialize(&bytes[8..payload_start])
            .map_err(|e| Error::corrupted(format!("unreadable table of contents: {}", e)))?;

        let payload_len = (bytes.len() - payload_start) as u64;
        let mut index = HashMap::with_capacity(toc.len());
        for (i, header) in toc.iter().enumerate() {
            let end = header.offset.checked_add(header.stored_len);
            if end.map_or(true, |end| end > payload_len) {
                return Err(Error::corrupted(format!(
                    "entry '{}' lies outside the archive",
                    header.key
                )));
            }
            let inflatable = header.stored_len.saturating_mul(MAX_INFLATION);
            match header.raw_len() {
                Some(raw) if raw <= inflatable && usize::try_from(raw).is_ok() => {}
                _ => {
                    return Err(Error::corrupted(format!(
                        "entry '{}' claims {} elements from {} stored bytes",
                        header.key, header.elements, header.stored_len
                    )))
                }
            }
            if header.kind == EntryKind::Scalar && header.elements != 1 {
                return Err(Error::corrupted(format!(
                    "scalar entry '{}' holds {} elements",
                    header.key, header.elements
                )));
            }
            if index.insert(header.key.clone(), i).is_some() {
                return Err(Error::DuplicateKey(header.key.clone()));
            }
        }

        Ok(ArchiveReader {
            bytes,
            toc,
            index,
            payload_start,
        })
    }

    /// Total archive size in bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Table of contents in write order.
    pub fn headers(&self) -> &[EntryHeader] {
        &self.toc
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.toc.iter().map(|h| h.key.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn header(&self, key: &str) -> Result<&EntryHeader> {
        self.index
            .get(key)
            .map(|&i| &self.toc[i])
            .ok_or_else(|| Error::missing_key(key))
    }

    /// Decode one entry.
    pub fn entry(&self, key: &str) -> Result<Entry> {
        let header = self.header(key)?;
        let start = self.payload_start + header.offset as usize;
        let frame = &self.bytes[start..start + header.stored_len as usize];
        let raw_len = header
            .raw_len()
            .ok_or_else(|| Error::corrupted(format!("entry '{}' too large", key)))?;
        let raw = decompress_zstd(frame, raw_len as usize)?;
        debug!(key, kind = header.kind.as_str(), elements = header.elements, "read entry");
        Ok(Entry::from_raw(header.kind, &raw))
    }

    /// Decode an integer scalar entry.
    pub fn scalar(&self, key: &str) -> Result<i64> {
        match self.entry(key)? {
            Entry::Scalar(v) => Ok(v),
            _ => Err(Error::InvalidEntry {
                key: key.to_string(),
                expected: "integer scalar",
            }),
        }
    }

    /// Decode a flattened int8 tensor entry.
    pub fn int8(&self, key: &str) -> Result<Vec<i8>> {
        match self.entry(key)? {
            Entry::Int8(v) => Ok(v),
            _ => Err(Error::InvalidEntry {
                key: key.to_string(),
                expected: "int8 array",
            }),
        }
    }

    /// Header `(format_version, bit_width)` as stored, without validation.
    pub fn info(&self) -> Result<ArchiveInfo> {
        match self.entry(INFO_KEY)? {
            Entry::Ints(v) if v.len() == 2 => Ok(ArchiveInfo {
                format_version: v[0],
                bit_width: v[1],
            }),
            _ => Err(Error::InvalidEntry {
                key: INFO_KEY.to_string(),
                expected: "two-element integer sequence",
            }),
        }
    }

    /// Read the header and check it against what this build decodes.
    pub fn validate(&self) -> Result<ArchiveInfo> {
        let info = self.info()?;
        if info.format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: info.format_version,
                expected: FORMAT_VERSION,
            });
        }
        if info.bit_width != BIT_WIDTH as i64 {
            return Err(Error::UnsupportedBitWidth {
                found: info.bit_width,
                expected: BIT_WIDTH as i64,
            });
        }
        Ok(info)
    }

    /// Names of layers recorded in the archive (keys carrying a `_fl` suffix).
    pub fn layer_names(&self) -> Vec<&str> {
        self.keys()
            .filter_map(|k| k.strip_suffix(crate::compress::FRACTIONAL_BITS_SUFFIX))
            .collect()
    }
}
