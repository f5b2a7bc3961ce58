//! C8: the alternate list that follows a Doc's header on its earliest/first
//! fragment — one entry per cached variant of the same resource.

use crate::cache::heap::{self, FieldCursor, HdrHeap, HeapObject, HttpHdr};
use crate::error::Result;
use crate::primitives::PointerWidth;

pub const MAGIC: u32 = 0xDCBADEED;
pub const MAGIC_ALIVE: u32 = 0xABCDDEED;
pub const MAGIC_DEAD: u32 = 0x0DEADEED;

/// Fragment offsets up to this count live inline in the Alternate record
/// itself; anything beyond spills into an external table.
pub const N_INTEGRAL_FRAG_OFFSETS: usize = 4;

/// One cached variant ("Alternate" in the producing proxy's own source) of
/// an object, with its request/response headers decoded as far as URL,
/// method and reason go.
#[derive(Debug, Clone)]
pub struct Alternate {
    pub magic: u32,
    pub writeable: i32,
    pub unmarshal_len: i32,
    pub id: i32,
    pub rid: i32,
    pub object_key: [u64; 2],
    pub object_size: u64,

    pub request: HttpHdr,
    pub response: HttpHdr,

    pub request_timestamp: i64,
    pub response_timestamp: i64,
    pub frag_offset_count: i32,
    pub integral_frag_offsets: [u64; N_INTEGRAL_FRAG_OFFSETS],
    pub fragment_offsets: Vec<u64>,

    pub request_headers: Option<String>,
    pub response_headers: Option<String>,
}

impl Alternate {
    /// The request URL for this alternate: the decoded URL object if present,
    /// else a best-effort scan of the raw request header bytes for the
    /// reversed `"ptth"` token (i.e. `"http"` read backwards), else `"Unknown"`.
    pub fn request_url(&self) -> String {
        if let Some(url) = &self.request.url {
            return url.to_string();
        }
        if let Some(raw) = &self.request_headers {
            let bytes = raw.as_bytes();
            let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
            if let Some(pos) = find_subslice(&reversed, b"ptth") {
                let begin = pos + 4;
                if begin <= raw.len() {
                    return raw[raw.len() - begin..].to_string();
                }
            }
        }
        "Unknown".to_string()
    }

    /// Parses a list of `Alternate`s out of `raw`, starting at its first byte
    /// and consuming one alternate at a time until the bytes run out or stop
    /// looking like an Alternate.
    pub fn from_buffer(raw: &[u8]) -> Result<Vec<Alternate>> {
        let ptr_width = PointerWidth::default();
        let mut out = Vec::new();
        let mut cursor = 0usize;

        while cursor < raw.len() {
            match parse_one(&raw[cursor..], ptr_width) {
                Some((alt, next)) => {
                    out.push(alt);
                    match next {
                        Some(n) => cursor += n.max(1),
                        None => break,
                    }
                }
                None => break,
            }
        }

        Ok(out)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_http_hdr_fields(c: &mut FieldCursor) -> Result<[u64; 6]> {
    let mut ptrs = [0u64; 6];
    for p in &mut ptrs {
        *p = c.ptr()?;
    }
    let _host_length = c.i32()?;
    let _port = c.i32()?;
    for _ in 0..4 {
        c.bool_()?;
    }
    Ok(ptrs)
}

fn parse_one(raw: &[u8], ptr_width: PointerWidth) -> Option<(Alternate, Option<usize>)> {
    let mut c = FieldCursor::new(raw, ptr_width);

    let magic = c.u32().ok()?;
    if magic == MAGIC_ALIVE {
        tracing::warn!("Alternate carries the 'alive' (unmarshaled) magic; should never appear on disk");
    } else if magic == MAGIC_DEAD {
        tracing::warn!("Alternate carries the 'dead' magic");
    } else if magic != MAGIC {
        return None;
    }

    let writeable = c.i32().ok()?;
    let unmarshal_len = c.i32().ok()?;
    let id = c.i32().ok()?;
    let rid = c.i32().ok()?;
    let object_key = [
        (c.i32().ok()? as u32 as u64) | ((c.i32().ok()? as u32 as u64) << 32),
        (c.i32().ok()? as u32 as u64) | ((c.i32().ok()? as u32 as u64) << 32),
    ];
    let object_size = (c.i32().ok()? as u32 as u64) | ((c.i32().ok()? as u32 as u64) << 32);

    let _request_ptrs = parse_http_hdr_fields(&mut c).ok()?;
    let response_ptrs = parse_http_hdr_fields(&mut c).ok()?;

    let request_timestamp = c.long().ok()?;
    let response_timestamp = c.long().ok()?;
    let frag_offset_count = c.i32().ok()?;
    let _frag_offsets_ptr = c.ulong().ok()?;
    let mut integral_frag_offsets = [0u64; N_INTEGRAL_FRAG_OFFSETS];
    for slot in &mut integral_frag_offsets {
        *slot = c.ulong().ok()?;
    }
    let _trailing_ptr = c.ulong().ok()?;

    let header_size = c.pos();

    let num_frags = (frag_offset_count as i64 - N_INTEGRAL_FRAG_OFFSETS as i64).max(0) as usize;
    let frag_table_size = num_frags * 8;
    let mut fragment_offsets = Vec::with_capacity(num_frags);
    let mut offset = header_size;
    if frag_table_size > 0 && offset + frag_table_size <= raw.len() {
        for i in 0..num_frags {
            let start = offset + i * 8;
            fragment_offsets.push(u64::from_ne_bytes(raw[start..start + 8].try_into().ok()?));
        }
        offset += frag_table_size;
    }

    let data_pos = offset;

    let (req_heap, req_struct_size) = HdrHeap::parse(&raw[offset..], ptr_width).ok()?;
    if !req_heap.verify() {
        return None;
    }
    let request_objects = heap::unpack_heap(
        &raw[data_pos..],
        req_struct_size,
        req_heap.size as usize,
        ptr_width,
    );
    let mut request = HttpHdr::default();
    for obj in request_objects {
        match obj {
            HeapObject::Url(u) => request.url = Some(u),
            HeapObject::Http(h) => {
                request.method = h.method;
            }
            _ => {}
        }
    }

    // Response heap begins at the byte offset named by the response side's
    // own persisted `mime_hdr_heap` pointer (the first of its six HTTPHdr
    // pointer fields).
    let response_heap_offset = response_ptrs[0] as usize;
    if response_heap_offset >= raw.len() {
        return None;
    }
    let (resp_heap, resp_struct_size) = HdrHeap::parse(&raw[response_heap_offset..], ptr_width).ok()?;
    if !resp_heap.verify() {
        return None;
    }
    let response_objects = heap::unpack_heap(
        &raw[response_heap_offset..],
        resp_struct_size,
        resp_heap.size as usize,
        ptr_width,
    );
    let mut response = HttpHdr::default();
    for obj in response_objects {
        match obj {
            HeapObject::Url(u) => response.url = Some(u),
            HeapObject::Http(h) => {
                response.reason = h.reason;
            }
            _ => {}
        }
    }

    let request_headers_end = response_heap_offset.saturating_sub(5).max(data_pos);
    let request_headers = raw
        .get(data_pos..request_headers_end)
        .map(|b| String::from_utf8_lossy(b).into_owned());

    let response_end = find_subslice(&raw[response_heap_offset..], &MAGIC.to_ne_bytes())
        .map(|p| response_heap_offset + p);
    let response_body_start = response_heap_offset + resp_heap.size.max(0) as usize;
    let response_headers = response_end
        .and_then(|end| raw.get(response_body_start.min(end)..end))
        .map(|b| String::from_utf8_lossy(b).into_owned());

    let alt = Alternate {
        magic,
        writeable,
        unmarshal_len,
        id,
        rid,
        object_key,
        object_size,
        request,
        response,
        request_timestamp,
        response_timestamp,
        frag_offset_count,
        integral_frag_offsets,
        fragment_offsets,
        request_headers,
        response_headers,
    };

    Some((alt, response_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_alternate_magic() {
        let raw = [0u8; 16];
        let alts = Alternate::from_buffer(&raw).unwrap();
        assert!(alts.is_empty());
    }

    #[test]
    fn request_url_falls_back_to_unknown_without_headers() {
        let alt = Alternate {
            magic: MAGIC,
            writeable: 0,
            unmarshal_len: 0,
            id: 0,
            rid: 0,
            object_key: [0, 0],
            object_size: 0,
            request: HttpHdr::default(),
            response: HttpHdr::default(),
            request_timestamp: 0,
            response_timestamp: 0,
            frag_offset_count: 0,
            integral_frag_offsets: [0; N_INTEGRAL_FRAG_OFFSETS],
            fragment_offsets: vec![],
            request_headers: None,
            response_headers: None,
        };
        assert_eq!(alt.request_url(), "Unknown");
    }

    #[test]
    fn request_url_scans_reversed_ptth_token() {
        let mut alt = Alternate {
            magic: MAGIC,
            writeable: 0,
            unmarshal_len: 0,
            id: 0,
            rid: 0,
            object_key: [0, 0],
            object_size: 0,
            request: HttpHdr::default(),
            response: HttpHdr::default(),
            request_timestamp: 0,
            response_timestamp: 0,
            frag_offset_count: 0,
            integral_frag_offsets: [0; N_INTEGRAL_FRAG_OFFSETS],
            fragment_offsets: vec![],
            request_headers: Some("GET / HTTP/1.1\r\nHost: x\r\n\r\nhttp://example.com/foo".into()),
            response_headers: None,
        };
        alt.request.url = None;
        assert_eq!(alt.request_url(), "http://example.com/foo");
    }
}
