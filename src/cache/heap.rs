//! C7: the header-heap decoder. A heap is a contiguous byte region that
//! begins with an `HdrHeap` record and is followed by a run of typed
//! objects (URL, HTTP, MIME field/block) packed with pointer-sized
//! alignment between them.

use byteorder::{NativeEndian, ByteOrder};

use crate::error::{CacheError, Result};
use crate::primitives::{align, PointerWidth};

pub const MAGIC: u32 = 0xDCBAFEED;

/// A cursor over heap bytes that reproduces the alignment a C compiler would
/// insert between struct members: each field is read from the next offset
/// that is a multiple of its own size.
pub(crate) struct FieldCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    ptr_width: usize,
}

impl<'a> FieldCursor<'a> {
    pub(crate) fn new(buf: &'a [u8], ptr_width: PointerWidth) -> Self {
        FieldCursor {
            buf,
            pos: 0,
            ptr_width: ptr_width.bytes(),
        }
    }

    fn take(&mut self, size: usize) -> Result<&'a [u8]> {
        self.pos = align(self.pos as u64, size as u64) as usize;
        let end = self
            .pos
            .checked_add(size)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| CacheError::EntryCorrupt("heap object ran past buffer end".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn bool_(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        Ok(NativeEndian::read_i16(self.take(2)?))
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(NativeEndian::read_u16(self.take(2)?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(NativeEndian::read_i32(self.take(4)?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(NativeEndian::read_u32(self.take(4)?))
    }

    pub(crate) fn ptr(&mut self) -> Result<u64> {
        let bytes = self.take(self.ptr_width)?;
        Ok(if self.ptr_width == 8 {
            NativeEndian::read_u64(bytes)
        } else {
            NativeEndian::read_u32(bytes) as u64
        })
    }

    /// A C `long`/`unsigned long`: assumed equal in width to a pointer, true
    /// of every LP64 target this decoder cares about.
    pub(crate) fn long(&mut self) -> Result<i64> {
        let bytes = self.take(self.ptr_width)?;
        Ok(if self.ptr_width == 8 {
            NativeEndian::read_i64(bytes)
        } else {
            NativeEndian::read_i32(bytes) as i64
        })
    }

    pub(crate) fn ulong(&mut self) -> Result<u64> {
        Ok(self.long()? as u64)
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn end_pos(&self) -> usize {
        self.pos
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StrHeapDesc {
    pub ptr: u64,
    pub start: u64,
    pub length: i32,
    pub locked: bool,
}

/// The fixed header that precedes every heap's object stream.
#[derive(Debug, Clone, Copy)]
pub struct HdrHeap {
    pub magic: u32,
    pub free_start: u64,
    pub data_start: u64,
    pub size: i32,
    pub writeable: bool,
    pub next: u64,
    pub free_size: i32,
    pub rwheap: u64,
    pub ronly_heaps: [StrHeapDesc; 3],
    pub lost_str_space: i32,
}

impl HdrHeap {
    pub fn parse(buf: &[u8], ptr_width: PointerWidth) -> Result<(Self, usize)> {
        let mut c = FieldCursor::new(buf, ptr_width);
        let magic = c.u32()?;
        if magic != MAGIC {
            return Err(CacheError::EntryCorrupt(format!(
                "bad HdrHeap magic: 0x{magic:X}"
            )));
        }
        let free_start = c.ptr()?;
        let data_start = c.ptr()?;
        let size = c.i32()?;
        let writeable = c.bool_()?;
        let next = c.ptr()?;
        let free_size = c.i32()?;
        let rwheap = c.ptr()?;

        let mut ronly_heaps = [StrHeapDesc {
            ptr: 0,
            start: 0,
            length: 0,
            locked: false,
        }; 3];
        for desc in &mut ronly_heaps {
            let ptr = c.ptr()?;
            let start = c.ptr()?;
            let length = c.i32()?;
            let locked = c.bool_()?;
            *desc = StrHeapDesc {
                ptr,
                start,
                length,
                locked,
            };
        }

        let lost_str_space = c.i32()?;

        let heap = HdrHeap {
            magic,
            free_start,
            data_start,
            size,
            writeable,
            next,
            free_size,
            rwheap,
            ronly_heaps,
            lost_str_space,
        };

        let struct_size = align(c.end_pos() as u64, ptr_width.bytes() as u64) as usize;
        Ok((heap, struct_size))
    }

    /// A heap stored on disk should never be writeable, in-use, or linked to
    /// another heap; these all indicate a live in-memory structure leaked
    /// onto disk rather than the marshaled form we expect.
    pub fn verify(&self) -> bool {
        self.magic == MAGIC
            && !self.writeable
            && self.free_start == 0
            && self.next == 0
            && self.free_size == 0
            && self.ronly_heaps[0].ptr == 0
            && self.ronly_heaps[1].start == 0
            && self.ronly_heaps[2].start == 0
    }
}

/// A concrete, human-usable URL — the target this whole decoder ultimately
/// exists to recover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub protocol: Option<String>,
    pub user: Option<String>,
    pub passwd: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub params: Option<String>,
    pub query: Option<String>,
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(p) = &self.protocol {
            write!(f, "{p}://")?;
        }
        match (&self.user, &self.passwd) {
            (Some(u), Some(p)) => write!(f, "{u}:{p}@")?,
            (Some(u), None) => write!(f, "{u}@")?,
            (None, Some(p)) => write!(f, ":{p}@")?,
            (None, None) => {}
        }
        if let Some(h) = &self.host {
            write!(f, "{h}")?;
        }
        if let Some(p) = self.port {
            write!(f, ":{p}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        Ok(())
    }
}

/// Fields recovered about one side (request or response) of an Alternate's
/// HTTP headers.
#[derive(Debug, Clone, Default)]
pub struct HttpHdr {
    pub method: Option<String>,
    pub reason: Option<String>,
    pub url: Option<Url>,
}

fn decode_part(heap: &[u8], ptr: u64, len: i16) -> Option<String> {
    if len <= 0 {
        return None;
    }
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    heap.get(start..end)
        .and_then(|b| std::str::from_utf8(b).ok())
        .map(|s| s.to_string())
}

fn parse_url(heap: &[u8], mut c: FieldCursor) -> Result<Url> {
    let mut lens = [0i16; 10];
    for l in &mut lens {
        *l = c.i16()?;
    }
    let mut ptrs = [0u64; 8];
    for p in &mut ptrs {
        *p = c.ptr()?;
    }
    let port_field = c.u16()?;
    let _flag_a = c.u8()?;
    let _flag_b = c.u8()?;
    let _has_port_in_header = c.bool_()?;

    let parts: Vec<Option<String>> = (0..8)
        .map(|i| decode_part(heap, ptrs[i], lens[i]))
        .collect();

    Ok(Url {
        protocol: parts[0].clone(),
        user: parts[1].clone(),
        passwd: parts[2].clone(),
        host: parts[3].clone(),
        port: if port_field != 0 { Some(port_field) } else { None },
        path: parts[4].clone(),
        params: parts[5].clone(),
        query: parts[6].clone(),
    })
}

fn parse_http(heap: &[u8], mut c: FieldCursor) -> Result<HttpHdr> {
    let polarity = c.u32()?;
    match polarity {
        1 => {
            let _reserved = c.i32()?;
            let _ptr_a = c.ptr()?;
            let ptr_b = c.ptr()?;
            let len = c.u16()?;
            let _pad = c.i16()?;
            let _ptr_c = c.ptr()?;
            Ok(HttpHdr {
                method: decode_part(heap, ptr_b, len as i16),
                reason: None,
                url: None,
            })
        }
        2 => {
            let _reserved = c.i32()?;
            let ptr_a = c.ptr()?;
            let len = c.u16()?;
            let _pad = c.i16()?;
            let _ptr_b = c.ptr()?;
            Ok(HttpHdr {
                method: None,
                reason: decode_part(heap, ptr_a, len as i16),
                url: None,
            })
        }
        other => Err(CacheError::EntryCorrupt(format!(
            "unknown HTTPImpl polarity: {other}"
        ))),
    }
}

/// One decoded object's type tag and, where applicable, a materialized
/// result.
#[derive(Debug, Clone)]
pub enum HeapObject {
    Url(Url),
    Http(HttpHdr),
    /// MIME field or field-block: structural only, not interpreted further.
    Mime,
    Unknown(u8),
}

/// Walks the typed-object stream of a heap body (`heap[offset..size]`),
/// decoding URL and HTTP objects and skipping MIME ones structurally.
/// Stops (without erroring) at the first decode failure, per §4.7.
pub fn unpack_heap(heap: &[u8], mut offset: usize, size: usize, ptr_width: PointerWidth) -> Vec<HeapObject> {
    let mut out = Vec::new();

    while offset < size && offset + 4 <= heap.len() {
        let b = &heap[offset..offset + 4];
        let obj_type = b[0];
        let flags = (b[3] & 0xF0) >> 4;
        let length = (u16::from_ne_bytes([b[1], b[2]]) as u32) | (((b[3] & 0x0F) as u32) << 16);
        let _ = flags;

        if length < 4 {
            break;
        }
        let body_start = offset + 4;
        let body_end = match body_start.checked_add(length as usize - 4) {
            Some(e) if e <= heap.len() => e,
            _ => break,
        };
        let body = &heap[body_start..body_end];

        let result = match obj_type {
            2 => parse_url(heap, FieldCursor::new(body, ptr_width)).map(HeapObject::Url),
            3 => parse_http(heap, FieldCursor::new(body, ptr_width)).map(HeapObject::Http),
            4 | 5 => Ok(HeapObject::Mime),
            t => Ok(HeapObject::Unknown(t)),
        };

        match result {
            Ok(obj) => out.push(obj),
            Err(_) => break,
        }

        offset = align(offset as u64 + length as u64, ptr_width.bytes() as u64) as usize;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header_bytes(ptr_width: PointerWidth) -> Vec<u8> {
        let mut buf = Vec::new();
        let pw = ptr_width.bytes();
        buf.extend_from_slice(&MAGIC.to_ne_bytes());
        buf.resize(align(buf.len() as u64, pw as u64) as usize, 0);
        buf.resize(buf.len() + pw, 0); // free_start
        buf.resize(buf.len() + pw, 0); // data_start
        buf.resize(align(buf.len() as u64, 4) as usize + 4, 0); // size
        buf.push(0); // writeable = false
        buf.resize(align(buf.len() as u64, pw as u64) as usize + pw, 0); // next
        buf.resize(align(buf.len() as u64, 4) as usize + 4, 0); // free_size
        buf.resize(align(buf.len() as u64, pw as u64) as usize + pw, 0); // rwheap
        for _ in 0..3 {
            buf.resize(align(buf.len() as u64, pw as u64) as usize + pw, 0); // ptr
            buf.resize(align(buf.len() as u64, pw as u64) as usize + pw, 0); // start
            buf.resize(align(buf.len() as u64, 4) as usize + 4, 0); // length
            buf.push(0); // locked
        }
        buf.resize(align(buf.len() as u64, 4) as usize + 4, 0); // lost_str_space
        buf
    }

    #[test]
    fn parses_and_verifies_clean_heap() {
        for pw in [PointerWidth::Bits32, PointerWidth::Bits64] {
            let buf = sample_header_bytes(pw);
            let (heap, _size) = HdrHeap::parse(&buf, pw).unwrap();
            assert_eq!(heap.magic, MAGIC);
            assert!(heap.verify());
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample_header_bytes(PointerWidth::Bits64);
        buf[0] = 0;
        let err = HdrHeap::parse(&buf, PointerWidth::Bits64).unwrap_err();
        assert!(matches!(err, CacheError::EntryCorrupt(_)));
    }

    #[test]
    fn url_display_matches_expected_form() {
        let url = Url {
            protocol: Some("http".into()),
            user: None,
            passwd: None,
            host: Some("example.com".into()),
            port: Some(8080),
            path: Some("index.html".into()),
            params: None,
            query: None,
        };
        assert_eq!(url.to_string(), "http://example.com:8080/index.html");
    }
}
