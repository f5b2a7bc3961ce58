//! C6: the `Doc` header that precedes every stored fragment, plus the split
//! of a fragment's bytes into header / alternate-list / content data.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt};

use crate::cache::alternate::Alternate;
use crate::cache::directory::DirEntry;
use crate::error::{CacheError, Result};
use crate::primitives::FipsMode;

/// Non-FIPS magic for a well-formed `Doc` header.
pub const MAGIC: u32 = 0x5F129B13;
/// Magic written over a `Doc` header that's been invalidated in place.
pub const CORRUPT_MAGIC: u32 = 0xDEADBABE;

/// Size of the fixed portion of a `Doc` header, not counting the
/// FIPS-doubled key material. `II5QI4BIIII` laid out with natural alignment.
const FIXED_HEADER_SIZE: usize = 72;

/// A single fragment header ("Doc" in the producing proxy's own source).
/// Each part of a stored object is preceded on disk by one of these.
#[derive(Debug, Clone)]
pub struct Doc {
    pub magic: u32,
    pub length: u32,
    pub total_length: u64,
    pub keys: Vec<u64>,
    pub hlen: u32,
    pub doc_type: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub unused: u8,
    pub sync_serial: u32,
    pub write_serial: u32,
    pub pinned: u32,
    pub checksum: u32,

    /// Raw alternate-list bytes (`hlen` of them), present only on the
    /// earliest/first fragment of an object.
    pub info: Vec<u8>,
    /// Raw content bytes for this fragment.
    pub data: Vec<u8>,
}

impl Doc {
    /// Size in bytes of the fixed `Doc` header, given whether the cache was
    /// built with FIPS mode enabled (which doubles the hash-key words).
    pub fn header_size(fips: FipsMode) -> usize {
        // Four key words normally; the FIXED_HEADER_SIZE above already
        // accounts for those four, so only add the extra four when doubled.
        FIXED_HEADER_SIZE + if fips.0 { 4 * 8 } else { 0 }
    }

    fn parse_header(buf: &[u8], fips: FipsMode) -> Result<Self> {
        let mut c = buf;
        let magic = c.read_u32::<NativeEndian>()?;
        if magic == CORRUPT_MAGIC {
            return Err(CacheError::EntryCorrupt("Doc header is corrupt".into()));
        }
        if magic != MAGIC {
            return Err(CacheError::EntryCorrupt(format!(
                "raw data does not represent a Doc (magic 0x{magic:X})"
            )));
        }
        let length = c.read_u32::<NativeEndian>()?;
        let total_length = c.read_u64::<NativeEndian>()?;

        let num_keys = if fips.0 { 8 } else { 4 };
        let mut keys = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            keys.push(c.read_u64::<NativeEndian>()?);
        }

        let hlen = c.read_u32::<NativeEndian>()?;

        // docType:8, versionMajor:8, versionMinor:8, unused:8 packed into one u32.
        let packed = c.read_u32::<NativeEndian>()?;
        let doc_type = (packed & 0xFF) as u8;
        let version_major = ((packed >> 8) & 0xFF) as u8;
        let version_minor = ((packed >> 16) & 0xFF) as u8;
        let unused = ((packed >> 24) & 0xFF) as u8;

        let sync_serial = c.read_u32::<NativeEndian>()?;
        let write_serial = c.read_u32::<NativeEndian>()?;
        let pinned = c.read_u32::<NativeEndian>()?;
        let checksum = c.read_u32::<NativeEndian>()?;

        Ok(Doc {
            magic,
            length,
            total_length,
            keys,
            hlen,
            doc_type,
            version_major,
            version_minor,
            unused,
            sync_serial,
            write_serial,
            pinned,
            checksum,
            info: Vec::new(),
            data: Vec::new(),
        })
    }

    /// Reads the fragment pointed to by `entry` out of an already-open cache
    /// file, splitting it into header / alternate-list / content bytes.
    pub fn fetch(file: &mut File, content_offset: u64, entry: &DirEntry, fips: FipsMode) -> Result<Self> {
        let header_size = Self::header_size(fips);

        file.seek(SeekFrom::Start(content_offset + entry.file_offset()))?;
        let mut buf = vec![0u8; entry.approx_length as usize];
        file.read_exact(&mut buf)?;

        let mut doc = Self::parse_header(&buf[..header_size.min(buf.len())], fips)?;

        let hlen = doc.hlen as usize;
        let total = doc.length as usize;
        let body = &buf[header_size.min(buf.len())..total.min(buf.len())];
        let split = hlen.min(body.len());
        doc.info = body[..split].to_vec();
        doc.data = body[split..].to_vec();

        Ok(doc)
    }

    /// Convenience wrapper over [`Doc::fetch`] that opens the cache file itself.
    pub fn fetch_from_path(
        path: &Path,
        content_offset: u64,
        entry: &DirEntry,
        fips: FipsMode,
    ) -> Result<Self> {
        let mut f = File::open(path)?;
        Self::fetch(&mut f, content_offset, entry, fips)
    }

    pub fn version(&self) -> String {
        format!("{}.{}", self.version_major, self.version_minor)
    }

    /// Whether this fragment carries alternate-list metadata (only true for
    /// the earliest/first fragment of an object).
    pub fn has_alternates(&self) -> bool {
        self.hlen > 0
    }

    /// Parses this fragment's alternate list, if any.
    pub fn alternates(&self) -> Result<Vec<Alternate>> {
        if !self.has_alternates() {
            return Ok(Vec::new());
        }
        Alternate::from_buffer(&self.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(fips: FipsMode, hlen: u32, length: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_ne_bytes());
        buf.extend_from_slice(&length.to_ne_bytes());
        buf.extend_from_slice(&12345u64.to_ne_bytes());
        let num_keys = if fips.0 { 8 } else { 4 };
        for i in 0..num_keys {
            buf.extend_from_slice(&(i as u64).to_ne_bytes());
        }
        buf.extend_from_slice(&hlen.to_ne_bytes());
        let packed: u32 = 1 | (24 << 8) | (0 << 16) | (0 << 24);
        buf.extend_from_slice(&packed.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // sync_serial
        buf.extend_from_slice(&0u32.to_ne_bytes()); // write_serial
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pinned
        buf.extend_from_slice(&0u32.to_ne_bytes()); // checksum
        buf
    }

    #[test]
    fn parses_non_fips_header() {
        let fips = FipsMode(false);
        let buf = sample_header(fips, 0, Doc::header_size(fips) as u32);
        let doc = Doc::parse_header(&buf, fips).unwrap();
        assert_eq!(doc.magic, MAGIC);
        assert_eq!(doc.keys.len(), 4);
        assert_eq!(doc.doc_type, 1);
        assert_eq!(doc.version(), "24.0");
    }

    #[test]
    fn fips_mode_doubles_key_words() {
        let fips = FipsMode(true);
        let buf = sample_header(fips, 0, Doc::header_size(fips) as u32);
        let doc = Doc::parse_header(&buf, fips).unwrap();
        assert_eq!(doc.keys.len(), 8);
        assert_eq!(Doc::header_size(fips), Doc::header_size(FipsMode(false)) + 32);
    }

    #[test]
    fn corrupt_magic_is_rejected_distinctly() {
        let fips = FipsMode(false);
        let mut buf = sample_header(fips, 0, 72);
        buf[0..4].copy_from_slice(&CORRUPT_MAGIC.to_ne_bytes());
        let err = Doc::parse_header(&buf, fips).unwrap_err();
        assert!(matches!(err, CacheError::EntryCorrupt(_)));
    }
}
