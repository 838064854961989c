//! SPDY/3.1 framing
//!
//! [`SpdyCodec`] is a tokio-util codec turning a byte stream into [`Frame`]s
//! and back. Header blocks are (de)compressed inside the codec, so each
//! codec instance owns the compression context for its direction.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::HeaderMap;
use tokio_util::codec::{Decoder, Encoder};

use super::headers::{HeaderCompressor, HeaderDecompressor};
use super::SpdyError;

pub const SPDY_VERSION: u16 = 3;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;

const TYPE_SYN_STREAM: u16 = 1;
const TYPE_SYN_REPLY: u16 = 2;
const TYPE_RST_STREAM: u16 = 3;
const TYPE_SETTINGS: u16 = 4;
const TYPE_PING: u16 = 6;
const TYPE_GOAWAY: u16 = 7;
const TYPE_HEADERS: u16 = 8;
const TYPE_WINDOW_UPDATE: u16 = 9;

const HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 0x00ff_ffff;
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// RST_STREAM status codes
pub mod status {
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INVALID_STREAM: u32 = 2;
    pub const REFUSED_STREAM: u32 = 3;
    pub const UNSUPPORTED_VERSION: u32 = 4;
    pub const CANCEL: u32 = 5;
    pub const INTERNAL_ERROR: u32 = 6;
    pub const FLOW_CONTROL_ERROR: u32 = 7;
    pub const STREAM_IN_USE: u32 = 8;
    pub const STREAM_ALREADY_CLOSED: u32 = 9;
    pub const FRAME_TOO_LARGE: u32 = 11;

    /// Human readable name of a status code
    pub fn name(code: u32) -> &'static str {
        match code {
            PROTOCOL_ERROR => "PROTOCOL_ERROR",
            INVALID_STREAM => "INVALID_STREAM",
            REFUSED_STREAM => "REFUSED_STREAM",
            UNSUPPORTED_VERSION => "UNSUPPORTED_VERSION",
            CANCEL => "CANCEL",
            INTERNAL_ERROR => "INTERNAL_ERROR",
            FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            STREAM_IN_USE => "STREAM_IN_USE",
            STREAM_ALREADY_CLOSED => "STREAM_ALREADY_CLOSED",
            FRAME_TOO_LARGE => "FRAME_TOO_LARGE",
            _ => "UNKNOWN",
        }
    }
}

/// A single SPDY frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data {
        stream_id: u32,
        flags: u8,
        data: Bytes,
    },
    SynStream {
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
        flags: u8,
        headers: HeaderMap,
    },
    SynReply {
        stream_id: u32,
        flags: u8,
        headers: HeaderMap,
    },
    RstStream {
        stream_id: u32,
        status: u32,
    },
    Settings {
        flags: u8,
        entries: Vec<(u8, u32, u32)>,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: u32,
        status: u32,
    },
    Headers {
        stream_id: u32,
        flags: u8,
        headers: HeaderMap,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
}

impl Frame {
    pub fn data(stream_id: u32, data: Bytes, fin: bool) -> Self {
        Frame::Data {
            stream_id,
            flags: if fin { FLAG_FIN } else { 0 },
            data,
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Frame::data(stream_id, Bytes::new(), true)
    }

    pub fn rst(stream_id: u32, status: u32) -> Self {
        Frame::RstStream { stream_id, status }
    }

    /// Stream the frame belongs to, if any
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::SynStream { stream_id, .. }
            | Frame::SynReply { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }
}

/// Frame codec for one direction of a SPDY connection
#[derive(Default)]
pub struct SpdyCodec {
    compressor: HeaderCompressor,
    decompressor: HeaderDecompressor,
}

impl SpdyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_control(
        &mut self,
        kind: u16,
        flags: u8,
        mut payload: Bytes,
    ) -> Result<Option<Frame>, SpdyError> {
        let frame = match kind {
            TYPE_SYN_STREAM => {
                expect_len(&payload, 10, "SYN_STREAM")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let associated_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let priority = payload.get_u8() >> 5;
                let _slot = payload.get_u8();
                let headers = self.decompress(&payload)?;
                Frame::SynStream { stream_id, associated_stream_id, priority, flags, headers }
            }
            TYPE_SYN_REPLY => {
                expect_len(&payload, 4, "SYN_REPLY")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let headers = self.decompress(&payload)?;
                Frame::SynReply { stream_id, flags, headers }
            }
            TYPE_RST_STREAM => {
                expect_len(&payload, 8, "RST_STREAM")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let status = payload.get_u32();
                Frame::RstStream { stream_id, status }
            }
            TYPE_SETTINGS => {
                expect_len(&payload, 4, "SETTINGS")?;
                let count = payload.get_u32() as usize;
                if payload.len() != count.saturating_mul(8) {
                    return Err(SpdyError::Protocol("SETTINGS length mismatch".to_string()));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let word = payload.get_u32();
                    let value = payload.get_u32();
                    entries.push(((word >> 24) as u8, word & 0x00ff_ffff, value));
                }
                Frame::Settings { flags, entries }
            }
            TYPE_PING => {
                expect_len(&payload, 4, "PING")?;
                Frame::Ping { id: payload.get_u32() }
            }
            TYPE_GOAWAY => {
                expect_len(&payload, 8, "GOAWAY")?;
                let last_good_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let status = payload.get_u32();
                Frame::GoAway { last_good_stream_id, status }
            }
            TYPE_HEADERS => {
                expect_len(&payload, 4, "HEADERS")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let headers = self.decompress(&payload)?;
                Frame::Headers { stream_id, flags, headers }
            }
            TYPE_WINDOW_UPDATE => {
                expect_len(&payload, 8, "WINDOW_UPDATE")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let delta = payload.get_u32() & STREAM_ID_MASK;
                Frame::WindowUpdate { stream_id, delta }
            }
            // Unknown control frames are ignored
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }

    fn decompress(&mut self, block: &[u8]) -> Result<HeaderMap, SpdyError> {
        if block.is_empty() {
            return Ok(HeaderMap::new());
        }
        self.decompressor.decompress(block)
    }
}

fn expect_len(payload: &Bytes, min: usize, kind: &str) -> Result<(), SpdyError> {
    if payload.len() < min {
        return Err(SpdyError::Protocol(format!(
            "{} frame too short: {} bytes", kind, payload.len()
        )));
    }
    Ok(())
}

impl Decoder for SpdyCodec {
    type Item = Frame;
    type Error = SpdyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, SpdyError> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let length = ((src[5] as usize) << 16) | ((src[6] as usize) << 8) | src[7] as usize;
            if src.len() < HEADER_LEN + length {
                src.reserve(HEADER_LEN + length - src.len());
                return Ok(None);
            }

            let mut head = src.split_to(HEADER_LEN);
            let payload = src.split_to(length).freeze();
            let first = head.get_u32();
            let flags = head.get_u8();

            if first & 0x8000_0000 == 0 {
                return Ok(Some(Frame::Data {
                    stream_id: first & STREAM_ID_MASK,
                    flags,
                    data: payload,
                }));
            }

            let version = ((first >> 16) & 0x7fff) as u16;
            if version != SPDY_VERSION {
                return Err(SpdyError::Protocol(format!("unsupported SPDY version {}", version)));
            }
            let kind = (first & 0xffff) as u16;
            if let Some(frame) = self.decode_control(kind, flags, payload)? {
                return Ok(Some(frame));
            }
        }
    }
}

impl Encoder<Frame> for SpdyCodec {
    type Error = SpdyError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), SpdyError> {
        match frame {
            Frame::Data { stream_id, flags, data } => {
                check_len(data.len())?;
                dst.reserve(HEADER_LEN + data.len());
                dst.put_u32(stream_id & STREAM_ID_MASK);
                put_flags_len(dst, flags, data.len());
                dst.put_slice(&data);
            }
            Frame::SynStream { stream_id, associated_stream_id, priority, flags, headers } => {
                let block = self.compressor.compress(&headers)?;
                put_control(dst, TYPE_SYN_STREAM, flags, 10 + block.len())?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(associated_stream_id & STREAM_ID_MASK);
                dst.put_u8((priority & 0x07) << 5);
                dst.put_u8(0);
                dst.put_slice(&block);
            }
            Frame::SynReply { stream_id, flags, headers } => {
                let block = self.compressor.compress(&headers)?;
                put_control(dst, TYPE_SYN_REPLY, flags, 4 + block.len())?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_slice(&block);
            }
            Frame::RstStream { stream_id, status } => {
                put_control(dst, TYPE_RST_STREAM, 0, 8)?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(status);
            }
            Frame::Settings { flags, entries } => {
                put_control(dst, TYPE_SETTINGS, flags, 4 + entries.len() * 8)?;
                dst.put_u32(entries.len() as u32);
                for (entry_flags, id, value) in entries {
                    dst.put_u32(((entry_flags as u32) << 24) | (id & 0x00ff_ffff));
                    dst.put_u32(value);
                }
            }
            Frame::Ping { id } => {
                put_control(dst, TYPE_PING, 0, 4)?;
                dst.put_u32(id);
            }
            Frame::GoAway { last_good_stream_id, status } => {
                put_control(dst, TYPE_GOAWAY, 0, 8)?;
                dst.put_u32(last_good_stream_id & STREAM_ID_MASK);
                dst.put_u32(status);
            }
            Frame::Headers { stream_id, flags, headers } => {
                let block = self.compressor.compress(&headers)?;
                put_control(dst, TYPE_HEADERS, flags, 4 + block.len())?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_slice(&block);
            }
            Frame::WindowUpdate { stream_id, delta } => {
                put_control(dst, TYPE_WINDOW_UPDATE, 0, 8)?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(delta & STREAM_ID_MASK);
            }
        }
        Ok(())
    }
}

fn check_len(len: usize) -> Result<(), SpdyError> {
    if len > MAX_FRAME_LEN {
        return Err(SpdyError::Protocol(format!("frame payload too large: {} bytes", len)));
    }
    Ok(())
}

fn put_control(dst: &mut BytesMut, kind: u16, flags: u8, len: usize) -> Result<(), SpdyError> {
    check_len(len)?;
    dst.reserve(HEADER_LEN + len);
    dst.put_u16(0x8000 | SPDY_VERSION);
    dst.put_u16(kind);
    put_flags_len(dst, flags, len);
    Ok(())
}

fn put_flags_len(dst: &mut BytesMut, flags: u8, len: usize) {
    dst.put_u32(((flags as u32) << 24) | (len as u32 & 0x00ff_ffff));
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn encode(codec: &mut SpdyCodec, frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_data_frame_layout() {
        let mut codec = SpdyCodec::new();
        let buf = encode(&mut codec, Frame::data(3, Bytes::from_static(b"hi"), true));
        assert_eq!(&buf[..], &[0, 0, 0, 3, FLAG_FIN, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_rst_stream_layout() {
        let mut codec = SpdyCodec::new();
        let buf = encode(&mut codec, Frame::rst(5, status::CANCEL));
        assert_eq!(&buf[..], &[0x80, 0x03, 0x00, 0x03, 0, 0, 0, 8, 0, 0, 0, 5, 0, 0, 0, 5]);
    }

    #[test]
    fn test_syn_stream_through_codec() {
        let mut headers = HeaderMap::new();
        headers.insert("streamtype", HeaderValue::from_static("data"));
        headers.insert("port", HeaderValue::from_static("8080"));
        headers.insert("requestid", HeaderValue::from_static("7"));

        let mut tx = SpdyCodec::new();
        let mut rx = SpdyCodec::new();
        let frame = Frame::SynStream {
            stream_id: 3,
            associated_stream_id: 0,
            priority: 0,
            flags: 0,
            headers,
        };
        let mut buf = encode(&mut tx, frame.clone());
        assert_eq!(&buf[..4], &[0x80, 0x03, 0x00, 0x01]);
        assert_eq!(rx.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let mut tx = SpdyCodec::new();
        let mut rx = SpdyCodec::new();
        let full = encode(&mut tx, Frame::Ping { id: 2 });

        let mut buf = BytesMut::from(&full[..5]);
        assert_eq!(rx.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[5..]);
        assert_eq!(rx.decode(&mut buf).unwrap(), Some(Frame::Ping { id: 2 }));
    }

    #[test]
    fn test_unknown_control_frame_skipped() {
        let mut rx = SpdyCodec::new();
        let mut buf = BytesMut::new();
        // type 0x0a with a 2 byte payload, followed by a PING
        buf.extend_from_slice(&[0x80, 0x03, 0x00, 0x0a, 0, 0, 0, 2, 0xaa, 0xbb]);
        buf.extend_from_slice(&[0x80, 0x03, 0x00, 0x06, 0, 0, 0, 4, 0, 0, 0, 1]);
        assert_eq!(rx.decode(&mut buf).unwrap(), Some(Frame::Ping { id: 1 }));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut rx = SpdyCodec::new();
        let mut buf = BytesMut::from(&[0x80, 0x02, 0x00, 0x06, 0, 0, 0, 4, 0, 0, 0, 1][..]);
        assert!(matches!(rx.decode(&mut buf), Err(SpdyError::Protocol(_))));
    }

    #[test]
    fn test_settings_and_window_update() {
        let mut tx = SpdyCodec::new();
        let mut rx = SpdyCodec::new();
        let settings = Frame::Settings { flags: 0, entries: vec![(0, 7, 65536)] };
        let mut buf = encode(&mut tx, settings.clone());
        buf.extend_from_slice(&encode(&mut tx, Frame::WindowUpdate { stream_id: 1, delta: 1024 }));
        assert_eq!(rx.decode(&mut buf).unwrap(), Some(settings));
        assert_eq!(
            rx.decode(&mut buf).unwrap(),
            Some(Frame::WindowUpdate { stream_id: 1, delta: 1024 })
        );
    }
}
