//! C3: the disk header at a fixed offset, and the span that owns one file's
//! stripes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, ReadBytesExt};

use crate::error::{CacheError, Result};
use crate::primitives::{self, CacheType};

/// Fixed byte offset of the [`DiskHeader`] within every span.
pub const DISK_HEADER_OFFSET: u64 = 0x2000;

const DISK_HEADER_MAGIC: u32 = 0xABCD1237;

/// Two unsigned long longs, one signed int, one packed (type, free) u32 —
/// 24 bytes total, `QQiI` in the struct-module sense.
pub const STRIPE_HEADER_SIZE: u64 = 24;

/// The fixed-layout record at [`DISK_HEADER_OFFSET`].
#[derive(Debug, Clone, Copy)]
pub struct DiskHeader {
    pub magic: u32,
    pub volumes: u32,
    pub free: u32,
    pub used: u32,
    pub diskvol_blocks: u32,
    pub blocks: u64,
}

impl DiskHeader {
    pub const SIZE: usize = 28;

    fn read(buf: &[u8]) -> Result<Self> {
        let mut c = buf;
        let magic = c.read_u32::<NativeEndian>()?;
        let volumes = c.read_u32::<NativeEndian>()?;
        let free = c.read_u32::<NativeEndian>()?;
        let used = c.read_u32::<NativeEndian>()?;
        let diskvol_blocks = c.read_u32::<NativeEndian>()?;
        let blocks = c.read_u64::<NativeEndian>()?;

        if magic != DISK_HEADER_MAGIC {
            return Err(CacheError::CacheInvalid(format!(
                "bad disk header magic: 0x{magic:X}"
            )));
        }

        Ok(DiskHeader {
            magic,
            volumes,
            free,
            used,
            diskvol_blocks,
            blocks,
        })
    }
}

/// The raw per-stripe header preceding each stripe's metadata ("SpanBlockHeader").
#[derive(Debug, Clone, Copy)]
pub struct StripeHeader {
    pub offset: u64,
    pub length_blocks: u64,
    pub number: i32,
    pub cache_type: CacheType,
    pub free: bool,
}

impl StripeHeader {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut c = buf;
        let offset = c.read_u64::<NativeEndian>()?;
        let length_blocks = c.read_u64::<NativeEndian>()?;
        let number = c.read_i32::<NativeEndian>()?;
        let type_free = c.read_u32::<NativeEndian>()?;

        Ok(StripeHeader {
            offset,
            length_blocks,
            number,
            cache_type: CacheType::from_bits((type_free & 0x07) as u8),
            free: (type_free & 0x08) == 0x08,
        })
    }

    /// Length in bytes of the stripe's content region (not of this header).
    pub fn content_length(&self) -> u64 {
        self.length_blocks * primitives::STORE_BLOCK_SIZE
    }
}

/// One cache file or block device, opened read-only.
pub struct Span {
    pub path: PathBuf,
    pub file_len: u64,
    pub disk_header: DiskHeader,
    pub stripe_headers: Vec<StripeHeader>,
}

impl Span {
    /// Opens `path`, validates the disk header, and enumerates stripe
    /// headers. Stripe headers that fail to parse are skipped with a logged
    /// warning rather than aborting the whole span.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.seek(SeekFrom::End(0))?;

        file.seek(SeekFrom::Start(DISK_HEADER_OFFSET))?;
        let mut header_buf = [0u8; DiskHeader::SIZE];
        file.read_exact(&mut header_buf)?;
        let disk_header = DiskHeader::read(&header_buf)?;

        let total_bytes = disk_header.diskvol_blocks as u64 * STRIPE_HEADER_SIZE;
        let mut raw = vec![0u8; total_bytes as usize];
        file.read_exact(&mut raw)?;

        let mut stripe_headers = Vec::with_capacity(disk_header.diskvol_blocks as usize);
        for i in 0..disk_header.diskvol_blocks as usize {
            let chunk = &raw[i * STRIPE_HEADER_SIZE as usize..(i + 1) * STRIPE_HEADER_SIZE as usize];
            match StripeHeader::read(chunk) {
                Ok(h) => stripe_headers.push(h),
                Err(e) => tracing::warn!(span = %path.display(), index = i, error = %e, "skipping unreadable stripe header"),
            }
        }

        Ok(Span {
            path,
            file_len,
            disk_header,
            stripe_headers,
        })
    }
}
