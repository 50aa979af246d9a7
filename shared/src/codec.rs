//! Binary wire codec for control-channel frames.
//!
//! Each wire frame is `{1-byte type, varint length, body}`. The high bit of
//! the type byte is the continuation flag: when set, the logical frame
//! continues in the next wire frame of the same type and the receiver
//! concatenates the bodies before decoding. Strings are varint-prefixed
//! UTF-8, binary blobs are varint-prefixed bytes, optional fields carry a
//! presence byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};
use crate::frame::{
    ErrFrame, Frame, FrameType, Open, OpenAck, Req, RespBody, RespHead, Shutdown, StreamClose,
    StreamData, StreamOpen, MAX_FRAME_SIZE,
};

/// Continuation flag in the type byte.
pub const CONTINUATION: u8 = 0x80;

/// Maximum body bytes in a single wire frame; larger logical frames split.
pub const MAX_WIRE_BODY: usize = 256 * 1024;

/// Encode a logical frame into one or more complete wire frames, splitting
/// with the continuation bit when the body exceeds [`MAX_WIRE_BODY`].
pub fn encode(frame: &Frame) -> Vec<Bytes> {
    let body = encode_body(frame);
    let ty = frame.frame_type() as u8;

    if body.len() <= MAX_WIRE_BODY {
        return vec![wire_frame(ty, &body)];
    }

    let mut out = Vec::with_capacity(body.len() / MAX_WIRE_BODY + 1);
    let chunks: Vec<&[u8]> = body.chunks(MAX_WIRE_BODY).collect();
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let type_byte = if i < last { ty | CONTINUATION } else { ty };
        out.push(wire_frame(type_byte, chunk));
    }
    out
}

fn wire_frame(type_byte: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 10 + body.len());
    buf.put_u8(type_byte);
    put_varint(&mut buf, body.len() as u64);
    buf.put_slice(body);
    buf.freeze()
}

/// Reassembles wire frames into logical frames. One assembler per channel
/// direction; wire frames must arrive in channel order.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    partial: Option<(FrameType, BytesMut)>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one wire frame (one websocket binary message). Returns a
    /// logical frame once its final piece arrives.
    pub fn push(&mut self, wire: &[u8]) -> Result<Option<Frame>> {
        let mut rd = Reader::new(wire);
        let type_byte = rd.u8()?;
        let continued = type_byte & CONTINUATION != 0;
        let ty = FrameType::from_wire(type_byte & !CONTINUATION)
            .ok_or_else(|| Error::protocol(format!("unknown frame type {type_byte:#04x}")))?;
        let len = rd.varint()? as usize;
        let body = rd.take(len)?;
        if !rd.is_empty() {
            return Err(Error::protocol("trailing bytes after frame body"));
        }

        let mut buf = match self.partial.take() {
            Some((partial_ty, buf)) => {
                if partial_ty != ty {
                    return Err(Error::protocol(format!(
                        "continuation type mismatch: expected {partial_ty:?}, got {ty:?}"
                    )));
                }
                buf
            }
            None => BytesMut::new(),
        };

        if buf.len() + body.len() > MAX_FRAME_SIZE {
            return Err(Error::protocol("frame exceeds maximum size"));
        }
        buf.extend_from_slice(body);

        if continued {
            self.partial = Some((ty, buf));
            return Ok(None);
        }
        decode_body(ty, &buf).map(Some)
    }

    /// True while a split logical frame is mid-reassembly.
    pub fn mid_frame(&self) -> bool {
        self.partial.is_some()
    }
}

fn encode_body(frame: &Frame) -> BytesMut {
    let mut b = BytesMut::new();
    match frame {
        Frame::Open(f) => {
            b.put_u8(f.version);
            put_str(&mut b, &f.tunnel_id);
            put_str(&mut b, &f.local_target);
        }
        Frame::OpenAck(f) => {
            put_str(&mut b, &f.tunnel_id);
            put_str(&mut b, &f.subdomain);
            put_str(&mut b, &f.public_url);
            match f.port {
                Some(p) => {
                    b.put_u8(1);
                    b.put_u16(p);
                }
                None => b.put_u8(0),
            }
        }
        Frame::Shutdown(f) => put_str(&mut b, &f.reason),
        Frame::Req(f) => {
            put_str(&mut b, &f.request_id);
            put_str(&mut b, &f.method);
            put_str(&mut b, &f.path);
            put_headers(&mut b, &f.headers);
            put_bytes(&mut b, &f.body);
        }
        Frame::RespHead(f) => {
            put_str(&mut b, &f.request_id);
            b.put_u16(f.status);
            put_headers(&mut b, &f.headers);
        }
        Frame::RespBody(f) => {
            put_str(&mut b, &f.request_id);
            b.put_u8(u8::from(f.last));
            put_bytes(&mut b, &f.chunk);
        }
        Frame::StreamOpen(f) => {
            put_str(&mut b, &f.session_id);
            put_str(&mut b, &f.tunnel_id);
            put_str(&mut b, &f.peer_addr);
        }
        Frame::StreamData(f) => {
            put_str(&mut b, &f.session_id);
            put_bytes(&mut b, &f.data);
        }
        Frame::StreamClose(f) => {
            put_str(&mut b, &f.session_id);
            match f.error {
                Some(kind) => {
                    b.put_u8(1);
                    b.put_u8(kind.code());
                }
                None => b.put_u8(0),
            }
        }
        Frame::Ping(seq) => put_varint(&mut b, *seq),
        Frame::Pong(seq) => put_varint(&mut b, *seq),
        Frame::Err(f) => {
            put_str(&mut b, &f.correlation_id);
            b.put_u8(f.kind.code());
            match &f.message {
                Some(m) => {
                    b.put_u8(1);
                    put_str(&mut b, m);
                }
                None => b.put_u8(0),
            }
        }
    }
    b
}

fn decode_body(ty: FrameType, body: &[u8]) -> Result<Frame> {
    let mut rd = Reader::new(body);
    let frame = match ty {
        FrameType::Open => Frame::Open(Open {
            version: rd.u8()?,
            tunnel_id: rd.string()?,
            local_target: rd.string()?,
        }),
        FrameType::OpenAck => Frame::OpenAck(OpenAck {
            tunnel_id: rd.string()?,
            subdomain: rd.string()?,
            public_url: rd.string()?,
            port: if rd.u8()? != 0 { Some(rd.u16()?) } else { None },
        }),
        FrameType::Shutdown => Frame::Shutdown(Shutdown {
            reason: rd.string()?,
        }),
        FrameType::Req => Frame::Req(Req {
            request_id: rd.string()?,
            method: rd.string()?,
            path: rd.string()?,
            headers: rd.headers()?,
            body: rd.bytes()?,
        }),
        FrameType::RespHead => Frame::RespHead(RespHead {
            request_id: rd.string()?,
            status: rd.u16()?,
            headers: rd.headers()?,
        }),
        FrameType::RespBody => Frame::RespBody(RespBody {
            request_id: rd.string()?,
            last: rd.u8()? != 0,
            chunk: rd.bytes()?,
        }),
        FrameType::StreamOpen => Frame::StreamOpen(StreamOpen {
            session_id: rd.string()?,
            tunnel_id: rd.string()?,
            peer_addr: rd.string()?,
        }),
        FrameType::StreamData => Frame::StreamData(StreamData {
            session_id: rd.string()?,
            data: rd.bytes()?,
        }),
        FrameType::StreamClose => Frame::StreamClose(StreamClose {
            session_id: rd.string()?,
            error: if rd.u8()? != 0 {
                let code = rd.u8()?;
                Some(
                    ErrorKind::from_code(code)
                        .ok_or_else(|| Error::protocol(format!("unknown error code {code}")))?,
                )
            } else {
                None
            },
        }),
        FrameType::Ping => Frame::Ping(rd.varint()?),
        FrameType::Pong => Frame::Pong(rd.varint()?),
        FrameType::Err => {
            let correlation_id = rd.string()?;
            let code = rd.u8()?;
            let kind = ErrorKind::from_code(code)
                .ok_or_else(|| Error::protocol(format!("unknown error code {code}")))?;
            let message = if rd.u8()? != 0 {
                Some(rd.string()?)
            } else {
                None
            };
            Frame::Err(ErrFrame {
                correlation_id,
                kind,
                message,
            })
        }
    };
    if !rd.is_empty() {
        return Err(Error::protocol("trailing bytes in frame body"));
    }
    Ok(frame)
}

fn put_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_headers(buf: &mut BytesMut, headers: &[(String, String)]) {
    put_varint(buf, headers.len() as u64);
    for (name, value) in headers {
        put_str(buf, name);
        put_str(buf, value);
    }
}

/// Bounds-checked cursor over a wire frame body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::protocol("truncated frame"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn varint(&mut self) -> Result<u64> {
        let mut v: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
        }
        Err(Error::protocol("varint too long"))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("invalid utf-8 in frame"))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.varint()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn headers(&mut self) -> Result<Vec<(String, String)>> {
        let count = self.varint()? as usize;
        if count > 4096 {
            return Err(Error::protocol("header count out of range"));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push((self.string()?, self.string()?));
        }
        Ok(out)
    }
}
