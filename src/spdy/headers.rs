//! SPDY/3 header blocks
//!
//! Header blocks are a count of name/value pairs, each length-prefixed, run
//! through a zlib stream primed with the SPDY/3 dictionary. Each direction of
//! a connection keeps one compression context for its whole lifetime.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use http::header::{HeaderMap, HeaderName, HeaderValue};

use super::SpdyError;

/// Largest decompressed header block accepted from a peer
const MAX_HEADER_BLOCK: usize = 1024 * 1024;

/// Dictionary from the SPDY/3 draft, section 2.6.10.1
pub(crate) const SPDY3_DICTIONARY: &[u8] = b"\
    \x00\x00\x00\x07options\
    \x00\x00\x00\x04head\
    \x00\x00\x00\x04post\
    \x00\x00\x00\x03put\
    \x00\x00\x00\x06delete\
    \x00\x00\x00\x05trace\
    \x00\x00\x00\x06accept\
    \x00\x00\x00\x0eaccept-charset\
    \x00\x00\x00\x0faccept-encoding\
    \x00\x00\x00\x0faccept-language\
    \x00\x00\x00\x0daccept-ranges\
    \x00\x00\x00\x03age\
    \x00\x00\x00\x05allow\
    \x00\x00\x00\x0dauthorization\
    \x00\x00\x00\x0dcache-control\
    \x00\x00\x00\x0aconnection\
    \x00\x00\x00\x0ccontent-base\
    \x00\x00\x00\x10content-encoding\
    \x00\x00\x00\x10content-language\
    \x00\x00\x00\x0econtent-length\
    \x00\x00\x00\x10content-location\
    \x00\x00\x00\x0bcontent-md5\
    \x00\x00\x00\x0dcontent-range\
    \x00\x00\x00\x0ccontent-type\
    \x00\x00\x00\x04date\
    \x00\x00\x00\x04etag\
    \x00\x00\x00\x06expect\
    \x00\x00\x00\x07expires\
    \x00\x00\x00\x04from\
    \x00\x00\x00\x04host\
    \x00\x00\x00\x08if-match\
    \x00\x00\x00\x11if-modified-since\
    \x00\x00\x00\x0dif-none-match\
    \x00\x00\x00\x08if-range\
    \x00\x00\x00\x13if-unmodified-since\
    \x00\x00\x00\x0dlast-modified\
    \x00\x00\x00\x08location\
    \x00\x00\x00\x0cmax-forwards\
    \x00\x00\x00\x06pragma\
    \x00\x00\x00\x12proxy-authenticate\
    \x00\x00\x00\x13proxy-authorization\
    \x00\x00\x00\x05range\
    \x00\x00\x00\x07referer\
    \x00\x00\x00\x0bretry-after\
    \x00\x00\x00\x06server\
    \x00\x00\x00\x02te\
    \x00\x00\x00\x07trailer\
    \x00\x00\x00\x11transfer-encoding\
    \x00\x00\x00\x07upgrade\
    \x00\x00\x00\x0auser-agent\
    \x00\x00\x00\x04vary\
    \x00\x00\x00\x03via\
    \x00\x00\x00\x07warning\
    \x00\x00\x00\x10www-authenticate\
    \x00\x00\x00\x06method\
    \x00\x00\x00\x03get\
    \x00\x00\x00\x06status\
    \x00\x00\x00\x06200 OK\
    \x00\x00\x00\x07version\
    \x00\x00\x00\x08HTTP/1.1\
    \x00\x00\x00\x03url\
    \x00\x00\x00\x06public\
    \x00\x00\x00\x0aset-cookie\
    \x00\x00\x00\x0akeep-alive\
    \x00\x00\x00\x06origin\
    1001012012022052063003023033043053063074024054064074084094104114\
    12413414415416417502504505203 Non-Authoritative Information204 N\
    o Content301 Moved Permanently400 Bad Request401 Unauthorized403 \
    Forbidden404 Not Found500 Internal Server Error501 Not Implement\
    ed503 Service UnavailableJan Feb Mar Apr May Jun Jul Aug Sept Oc\
    t Nov Dec 00:00:00 Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMTchunked\
    ,text/html,image/png,image/jpg,image/gif,application/xml,applica\
    tion/xhtml+xml,text/plain,text/javascript,publicprivatemax-age=g\
    zip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.";

/// Serialize headers into an uncompressed header block
///
/// Names are written lowercase; repeated names are joined with NUL.
pub fn encode_block(headers: &HeaderMap) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(headers.keys_len() as u32);
    for name in headers.keys() {
        let mut value = Vec::new();
        for (i, v) in headers.get_all(name).iter().enumerate() {
            if i > 0 {
                value.push(0);
            }
            value.extend_from_slice(v.as_bytes());
        }
        buf.put_u32(name.as_str().len() as u32);
        buf.put_slice(name.as_str().as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(&value);
    }
    buf.freeze()
}

/// Parse an uncompressed header block
pub fn decode_block(mut block: &[u8]) -> Result<HeaderMap, SpdyError> {
    let count = read_u32(&mut block)? as usize;
    let mut headers = HeaderMap::with_capacity(count.min(64));
    for _ in 0..count {
        let name = read_chunk(&mut block)?;
        let value = read_chunk(&mut block)?;
        if name.is_empty() {
            return Err(SpdyError::Protocol("empty header name".to_string()));
        }
        if name.iter().any(|b| b.is_ascii_uppercase()) {
            return Err(SpdyError::Protocol(format!(
                "header name not lowercase: {}", String::from_utf8_lossy(name)
            )));
        }
        let name = HeaderName::from_bytes(name)
            .map_err(|e| SpdyError::Protocol(format!("invalid header name: {}", e)))?;
        for part in value.split(|b| *b == 0) {
            let value = HeaderValue::from_bytes(part)
                .map_err(|e| SpdyError::Protocol(format!("invalid header value: {}", e)))?;
            headers.append(name.clone(), value);
        }
    }
    if !block.is_empty() {
        return Err(SpdyError::Protocol("trailing bytes after header block".to_string()));
    }
    Ok(headers)
}

fn read_u32(block: &mut &[u8]) -> Result<u32, SpdyError> {
    if block.len() < 4 {
        return Err(SpdyError::Protocol("truncated header block".to_string()));
    }
    Ok(block.get_u32())
}

fn read_chunk<'a>(block: &mut &'a [u8]) -> Result<&'a [u8], SpdyError> {
    let len = read_u32(block)? as usize;
    if block.len() < len {
        return Err(SpdyError::Protocol("truncated header block".to_string()));
    }
    let (chunk, rest) = block.split_at(len);
    *block = rest;
    Ok(chunk)
}

/// Outbound half: compresses header blocks
pub struct HeaderCompressor {
    zlib: Compress,
    primed: bool,
}

impl Default for HeaderCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCompressor {
    pub fn new() -> Self {
        Self {
            zlib: Compress::new(Compression::default(), true),
            primed: false,
        }
    }

    /// Encode and compress a header block, sync-flushing the stream
    pub fn compress(&mut self, headers: &HeaderMap) -> Result<Bytes, SpdyError> {
        if !self.primed {
            self.zlib.set_dictionary(SPDY3_DICTIONARY)
                .map_err(|e| SpdyError::Compression(e.to_string()))?;
            self.primed = true;
        }

        let raw = encode_block(headers);
        let mut out = Vec::with_capacity(raw.len() + 64);
        let mut consumed = 0;
        loop {
            let before = self.zlib.total_in();
            self.zlib.compress_vec(&raw[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| SpdyError::Compression(e.to_string()))?;
            consumed += (self.zlib.total_in() - before) as usize;
            // A sync flush is complete once the output has room left over
            if consumed == raw.len() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(64));
        }
        Ok(Bytes::from(out))
    }
}

/// Inbound half: decompresses header blocks
pub struct HeaderDecompressor {
    zlib: Decompress,
}

impl Default for HeaderDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecompressor {
    pub fn new() -> Self {
        Self {
            zlib: Decompress::new(true),
        }
    }

    /// Decompress and parse one header block
    pub fn decompress(&mut self, block: &[u8]) -> Result<HeaderMap, SpdyError> {
        let mut out = Vec::with_capacity(block.len() * 4 + 64);
        let mut consumed = 0;
        loop {
            let before = self.zlib.total_in();
            let status = self.zlib.decompress_vec(&block[consumed..], &mut out, FlushDecompress::Sync);
            consumed += (self.zlib.total_in() - before) as usize;
            match status {
                Ok(_) => {}
                Err(e) => match e.needs_dictionary() {
                    Some(_) => {
                        self.zlib.set_dictionary(SPDY3_DICTIONARY)
                            .map_err(|e| SpdyError::Compression(e.to_string()))?;
                        continue;
                    }
                    None => return Err(SpdyError::Compression(e.to_string())),
                },
            }
            if consumed == block.len() && out.len() < out.capacity() {
                break;
            }
            if out.len() >= MAX_HEADER_BLOCK {
                return Err(SpdyError::Protocol("header block too large".to_string()));
            }
            out.reserve(out.capacity().max(64));
        }
        decode_block(&out)
    }
}
