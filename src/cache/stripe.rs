//! C4: stripe metadata — locating both metadata copies, picking the latest
//! by sync serial, and deriving segment/bucket geometry via the
//! successive-over-relaxation iteration the producing proxy itself uses.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use byteorder::{NativeEndian, ReadBytesExt};

use crate::cache::directory::{Directory, DIR_ENTRY_SIZE};
use crate::cache::span::StripeHeader;
use crate::error::{CacheError, Result};
use crate::primitives::align;

const METADATA_MAGIC: u32 = 0xF1D0F00D;

/// Size of the metadata header preceding a stripe's free-list and directory:
/// `u32 magic, i16 version_major, i16 version_minor, i64 create_time,
/// 3×u64 cursors, 8×u32 counters/flags` with natural C alignment — 72 bytes.
pub const METADATA_HEADER_SIZE: u64 = 72;

/// Default average object size used by the geometry iteration unless
/// overridden by `cache.min_average_object_size`.
pub const DEFAULT_AVG_OBJECT_SIZE: u64 = 8000;

fn ceil_div(a: i64, b: i64) -> i64 {
    -(-a).div_euclid(b)
}

/// Successive-over-relaxation geometry solver (three fixed iterations).
/// Returns `(buckets_per_segment, num_segments, content_offset)`.
pub fn sor_dir_size(start: u64, length: u64, avg_obj_size: u64) -> (u64, u64, u64) {
    fn step(buckets: i64, _segs: i64, content: i64, start: i64, length: i64, avg: i64) -> (i64, i64, i64) {
        let buckets = (length - content + start) / (4 * avg);
        let segs = ceil_div(buckets, 0x4000);
        let buckets = ceil_div(buckets, segs.max(1));
        let content = start
            + 16384 * (ceil_div(34 + segs, 4096) + ceil_div(5 * buckets * segs, 1024) + 1);
        (buckets, segs, content)
    }

    let (start, length, avg) = (start as i64, length as i64, avg_obj_size as i64);
    let (b1, s1, c1) = step(0, 0, start, start, length, avg);
    let (b2, s2, c2) = step(b1, s1, c1, start, length, avg);
    let (b3, s3, c3) = step(b2, s2, c2, start, length, avg);

    (b3 as u64, s3 as u64, c3 as u64)
}

#[derive(Debug, Clone)]
struct RawMetadata {
    magic: u32,
    version_major: u16,
    version_minor: u16,
    create_time: i64,
    write_cursor: u64,
    last_write_pos: u64,
    agg_pos: u64,
    generation: u32,
    phase: u32,
    cycle: u32,
    sync_serial: u32,
    write_serial: u32,
    dirty: u32,
    sector_size: u32,
    unused: u32,
}

impl RawMetadata {
    fn read(buf: &[u8]) -> Result<Self> {
        let mut c = buf;
        Ok(RawMetadata {
            magic: c.read_u32::<NativeEndian>()?,
            version_major: c.read_u16::<NativeEndian>()?,
            version_minor: c.read_u16::<NativeEndian>()?,
            create_time: c.read_i64::<NativeEndian>()?,
            write_cursor: c.read_u64::<NativeEndian>()?,
            last_write_pos: c.read_u64::<NativeEndian>()?,
            agg_pos: c.read_u64::<NativeEndian>()?,
            generation: c.read_u32::<NativeEndian>()?,
            phase: c.read_u32::<NativeEndian>()?,
            cycle: c.read_u32::<NativeEndian>()?,
            sync_serial: c.read_u32::<NativeEndian>()?,
            write_serial: c.read_u32::<NativeEndian>()?,
            dirty: c.read_u32::<NativeEndian>()?,
            sector_size: c.read_u32::<NativeEndian>()?,
            unused: c.read_u32::<NativeEndian>()?,
        })
    }
}

/// The intersection of a span and a cache volume, once its metadata has been
/// read. Construct via [`Stripe::read`].
pub struct Stripe {
    pub file: PathBuf,
    pub header: StripeHeader,

    pub version: (u16, u16),
    pub create_time: i64,
    pub write_cursor: u64,
    pub last_write_pos: u64,
    pub agg_pos: u64,
    pub generation: u32,
    pub phase: bool,
    pub cycle: u32,
    pub sync_serial: u32,
    pub write_serial: u32,
    pub dirty: u32,
    pub sector_size: u32,

    pub num_segments: u64,
    pub num_buckets_total: u64,
    pub num_dir_entries: u64,
    pub content_offset: u64,
    pub directory_offset: u64,
    pub validity_limit: u64,

    pub directory: Option<Directory>,
}

impl Stripe {
    /// Reads in the stripe's metadata (both copies, choosing the latest).
    /// Does not read the directory — see [`Stripe::read_directory`].
    pub fn read(file: PathBuf, header: StripeHeader, avg_obj_size: u64) -> Result<Self> {
        let mut f = File::open(&file)?;

        let (buckets, segs, content_offset) =
            sor_dir_size(header.offset, header.content_length(), avg_obj_size);
        let num_buckets_total = buckets * segs;
        let num_dir_entries = 4 * num_buckets_total;

        let mut directory_offset =
            align(header.offset + METADATA_HEADER_SIZE + 2 * segs, 8192);

        f.seek(SeekFrom::Start(header.offset))?;
        let mut buf_a = vec![0u8; METADATA_HEADER_SIZE as usize];
        f.read_exact(&mut buf_a)?;
        let a = RawMetadata::read(&buf_a)?;

        let offset_b = align(
            directory_offset + DIR_ENTRY_SIZE as u64 * num_dir_entries,
            1,
        ) + METADATA_HEADER_SIZE;
        let offset_b = align(offset_b, 8192);

        f.seek(SeekFrom::Start(offset_b))?;
        let mut buf_b = vec![0u8; METADATA_HEADER_SIZE as usize];
        f.read_exact(&mut buf_b)?;
        let b = RawMetadata::read(&buf_b).ok();

        let (data, effective_offset) = match &b {
            Some(b) if b.magic == METADATA_MAGIC && b.sync_serial > a.sync_serial => {
                directory_offset = align(offset_b + METADATA_HEADER_SIZE + 2 * segs, 8192);
                (b.clone(), offset_b)
            }
            _ => (a, header.offset),
        };

        if data.magic != METADATA_MAGIC {
            return Err(CacheError::CacheInvalid(format!(
                "bad stripe metadata magic: 0x{:X}",
                data.magic
            )));
        }

        let phase = data.phase != 0;
        let mut validity_limit = data.agg_pos.saturating_sub(content_offset);
        if phase {
            validity_limit += data.write_cursor;
        }
        validity_limit /= 0x200;

        let mut header = header;
        header.offset = effective_offset;

        Ok(Stripe {
            file,
            header,
            version: (data.version_major, data.version_minor),
            create_time: data.create_time,
            write_cursor: data.write_cursor,
            last_write_pos: data.last_write_pos,
            agg_pos: data.agg_pos,
            generation: data.generation,
            phase,
            cycle: data.cycle,
            sync_serial: data.sync_serial,
            write_serial: data.write_serial,
            dirty: data.dirty,
            sector_size: data.sector_size,
            num_segments: segs,
            num_buckets_total,
            num_dir_entries,
            content_offset,
            directory_offset,
            validity_limit,
            directory: None,
        })
    }

    /// Reads the entire directory into memory. Large — release with
    /// [`Stripe::release_directory`] between enumerations if memory matters.
    pub fn read_directory(&mut self) -> Result<()> {
        let mut f = File::open(&self.file)?;
        f.seek(SeekFrom::Start(self.directory_offset))?;
        let mut raw = vec![0u8; DIR_ENTRY_SIZE * self.num_dir_entries as usize];
        f.read_exact(&mut raw)?;
        self.directory = Some(Directory::from_raw(
            &raw,
            self.num_dir_entries as usize,
            self.num_segments as usize,
        )?);
        Ok(())
    }

    pub fn release_directory(&mut self) {
        self.directory = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario (6): doubling `avg_obj_size` from 8000 to 16000 halves the
    /// bucket count produced by the iteration (ceilings rounded up).
    #[test]
    fn doubling_avg_object_size_halves_buckets() {
        let start = 0x2000 + 24 * 64;
        let length = 256 * 1024 * 1024;

        let (b1, s1, _) = sor_dir_size(start, length, DEFAULT_AVG_OBJECT_SIZE);
        let (b2, s2, _) = sor_dir_size(start, length, DEFAULT_AVG_OBJECT_SIZE * 2);

        let total1 = b1 * s1;
        let total2 = b2 * s2;
        assert!(total2 <= total1);
        assert!(total1 as f64 / total2 as f64 <= 2.2);
        assert!(total1 as f64 / total2 as f64 >= 1.8);
    }

    #[test]
    fn num_dir_entries_is_four_times_buckets() {
        let (buckets, segs, _) = sor_dir_size(0x2000, 256 * 1024 * 1024, DEFAULT_AVG_OBJECT_SIZE);
        let total = buckets * segs;
        assert_eq!(4 * total % segs, 0);
    }
}
