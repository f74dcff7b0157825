//! Java Edition framing.
//!
//! A packet on the wire is `VarInt length || VarInt packet-id || payload`, where
//! `length` covers the id and the payload. Only the handshake, login-start and
//! status packets are ever decoded; everything after that is relayed verbatim.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Longest VarInt encoding of an `i32`.
pub const MAX_VAR_INT_LEN: usize = 5;

/// Upper bound for strings decoded by the proxy (protocol limit is 32767 chars).
pub const MAX_STRING_LEN: usize = 32767;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed packet length")]
    MalformedLength,
    #[error("varint is longer than 5 bytes")]
    VarIntTooLong,
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("string of {len} chars exceeds limit of {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("packet too large ({len} > {max})")]
    PacketTooLarge { len: usize, max: usize },
    #[error("connection closed")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;

/// Number of bytes `write_var_int` produces for `value`.
pub fn var_int_len(value: i32) -> usize {
    let mut v = value as u32;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub fn write_var_int(value: i32, out: &mut Vec<u8>) {
    let mut v = value as u32;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Decodes a VarInt from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the terminating byte.
pub fn decode_var_int(buf: &[u8]) -> Result<Option<(i32, usize)>> {
    let mut result: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VAR_INT_LEN {
            return Err(CodecError::VarIntTooLong);
        }
        result |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((result as i32, i + 1)));
        }
    }
    if buf.len() >= MAX_VAR_INT_LEN {
        return Err(CodecError::VarIntTooLong);
    }
    Ok(None)
}

/// Cursor over a packet payload.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_finished(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(CodecError::Truncated {
                need: n,
                have: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_var_int(&mut self) -> Result<i32> {
        match decode_var_int(self.buf)? {
            Some((v, n)) => {
                self.buf = &self.buf[n..];
                Ok(v)
            }
            None => Err(CodecError::Truncated {
                need: self.buf.len() + 1,
                have: self.buf.len(),
            }),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.take_array().map(i8::from_be_bytes)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.take_array().map(i64::from_be_bytes)
    }

    /// Reads a VarInt-prefixed UTF-8 string holding at most `max_chars` characters.
    pub fn read_string(&mut self, max_chars: usize) -> Result<&'a str> {
        let len = self.read_var_int()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        let len = len as usize;
        // A char is at most 4 bytes in UTF-8; the protocol counts UTF-16 units
        // but this bound is what vanilla servers apply before decoding.
        if len > max_chars.saturating_mul(4) {
            return Err(CodecError::StringTooLong {
                len,
                max: max_chars,
            });
        }
        let s = std::str::from_utf8(self.take(len)?).map_err(|_| CodecError::InvalidUtf8)?;
        let chars = s.chars().count();
        if chars > max_chars {
            return Err(CodecError::StringTooLong {
                len: chars,
                max: max_chars,
            });
        }
        Ok(s)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        self.take_array().map(Uuid::from_bytes)
    }

    /// Reads a VarInt-prefixed byte array.
    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let len = self.read_var_int()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        self.take(len as usize)
    }

    /// Consumes everything that is left.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Append-only payload builder mirroring [`Decoder`].
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_var_int(&mut self, v: i32) -> &mut Self {
        write_var_int(v, &mut self.buf);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(u8::from(v));
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        write_var_int(s.len() as i32, &mut self.buf);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn write_uuid(&mut self, id: &Uuid) -> &mut Self {
        self.buf.extend_from_slice(id.as_bytes());
        self
    }

    pub fn write_byte_array(&mut self, data: &[u8]) -> &mut Self {
        write_var_int(data.len() as i32, &mut self.buf);
        self.buf.extend_from_slice(data);
        self
    }

    /// Writes bytes without a length prefix (tail-greedy field).
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn decoder(&self) -> Decoder<'_> {
        Decoder::new(&self.payload)
    }

    /// Full frame: length prefix, id and payload.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = var_int_len(self.id) + self.payload.len();
        let mut out = Vec::with_capacity(var_int_len(body_len as i32) + body_len);
        write_var_int(body_len as i32, &mut out);
        write_var_int(self.id, &mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns the packet and the number of bytes it occupied, or `Ok(None)` when
/// more bytes are required.
pub fn decode_frame(buf: &[u8], max_len: usize) -> Result<Option<(Packet, usize)>> {
    let (len, prefix) = match decode_var_int(buf) {
        Ok(Some(v)) => v,
        Ok(None) => return Ok(None),
        Err(CodecError::VarIntTooLong) => return Err(CodecError::MalformedLength),
        Err(e) => return Err(e),
    };
    if len < 1 {
        return Err(CodecError::MalformedLength);
    }
    let len = len as usize;
    if len > max_len {
        return Err(CodecError::PacketTooLarge { len, max: max_len });
    }
    let total = prefix + len;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[prefix..total];
    let (id, id_len) = decode_var_int(body)?.ok_or(CodecError::Truncated {
        need: body.len() + 1,
        have: body.len(),
    })?;
    Ok(Some((Packet::new(id, body[id_len..].to_vec()), total)))
}

pub async fn write_packet<W>(w: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&packet.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads exactly one packet from an unbuffered stream.
pub async fn read_packet<R>(r: &mut R, max_len: usize) -> Result<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = Vec::with_capacity(MAX_VAR_INT_LEN);
    let len = loop {
        let byte = match r.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(if prefix.is_empty() {
                    CodecError::Eof
                } else {
                    CodecError::Truncated {
                        need: prefix.len() + 1,
                        have: prefix.len(),
                    }
                });
            }
            Err(e) => return Err(e.into()),
        };
        prefix.push(byte);
        match decode_var_int(&prefix) {
            Ok(Some((v, _))) => break v,
            Ok(None) => continue,
            Err(_) => return Err(CodecError::MalformedLength),
        }
    };
    if len < 1 {
        return Err(CodecError::MalformedLength);
    }
    let len = len as usize;
    if len > max_len {
        return Err(CodecError::PacketTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = r.read(&mut body[filled..]).await?;
        if n == 0 {
            return Err(CodecError::Truncated {
                need: len,
                have: filled,
            });
        }
        filled += n;
    }

    let (id, id_len) = decode_var_int(&body)?.ok_or(CodecError::Truncated {
        need: len + 1,
        have: len,
    })?;
    body.drain(..id_len);
    Ok(Packet::new(id, body))
}

/// Buffered packet reader used during the pre-tunnel phase.
///
/// Supports non-consuming peeks and can record every byte pulled off the
/// socket so that the exact client stream can be replayed to a backend.
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
    max_packet: usize,
    recording: Option<Vec<u8>>,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_packet: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_packet,
            recording: None,
        }
    }

    /// Starts recording. Bytes already buffered but not yet consumed are
    /// part of the recording.
    pub fn start_recording(&mut self) {
        self.recording = Some(self.buf.to_vec());
    }

    pub fn recorded(&self) -> &[u8] {
        self.recording.as_deref().unwrap_or_default()
    }

    pub fn take_recorded(&mut self) -> Vec<u8> {
        self.recording.take().unwrap_or_default()
    }

    /// Bytes read from the socket but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Pulls more bytes from the socket. Returns 0 on EOF.
    pub async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.inner.read(&mut chunk).await?;
        if n > 0 {
            self.buf.extend_from_slice(&chunk[..n]);
            if let Some(rec) = self.recording.as_mut() {
                rec.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(n)
    }

    async fn next_frame(&mut self) -> Result<(Packet, usize)> {
        loop {
            if let Some(frame) = decode_frame(&self.buf, self.max_packet)? {
                return Ok(frame);
            }
            if self.fill().await? == 0 {
                return Err(if self.buf.is_empty() {
                    CodecError::Eof
                } else {
                    CodecError::Truncated {
                        need: self.buf.len() + 1,
                        have: self.buf.len(),
                    }
                });
            }
        }
    }

    /// Returns the next packet without consuming it.
    pub async fn peek_packet(&mut self) -> Result<Packet> {
        self.next_frame().await.map(|(p, _)| p)
    }

    pub async fn read_packet(&mut self) -> Result<Packet> {
        let (packet, used) = self.next_frame().await?;
        self.buf.advance(used);
        Ok(packet)
    }
}
