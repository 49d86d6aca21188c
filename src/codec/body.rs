//! Body framing shared by the server and client codecs

use bytes::{Buf, BufMut, BytesMut};

use super::{header, HeaderMap, HeaderValue, HttpChunk, MessageHead, Version};
use crate::error::{Error, Result};

const MAX_CHUNK_LINE: usize = 4096;

/// How the body of a decoded message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    UntilEof,
}

impl BodyKind {
    /// Framing of a request body. Requests without length or chunking have no body.
    pub fn for_request<H: MessageHead>(head: &H) -> Result<Self> {
        if head.is_chunked() {
            return Ok(BodyKind::Chunked);
        }
        Ok(match declared_length(head.headers())? {
            Some(0) | None => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
        })
    }

    /// Framing of a response body. Without length or chunking it runs until close.
    pub fn for_response<H: MessageHead>(head: &H, bodiless: bool) -> Result<Self> {
        if bodiless {
            return Ok(BodyKind::Empty);
        }
        if head.is_chunked() {
            return Ok(BodyKind::Chunked);
        }
        Ok(match declared_length(head.headers())? {
            Some(0) => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
            None => BodyKind::UntilEof,
        })
    }
}

fn declared_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidMessage(format!("bad content-length {:?}", value)))?;
        if length.map_or(false, |seen| seen != parsed) {
            return Err(Error::InvalidMessage("conflicting content-length headers".to_string()));
        }
        length = Some(parsed);
    }
    Ok(length)
}

#[derive(Debug, Clone, Copy)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Incremental body decoder. Each call yields at most one chunk; the chunk that
/// completes the body has `last` set.
#[derive(Debug)]
pub struct BodyDecoder {
    kind: BodyKind,
    remaining: u64,
    chunked: ChunkedState,
}

impl BodyDecoder {
    pub fn new(kind: BodyKind) -> Self {
        let remaining = match kind {
            BodyKind::Length(n) => n,
            _ => 0,
        };
        Self {
            kind,
            remaining,
            chunked: ChunkedState::Size,
        }
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpChunk>> {
        match self.kind {
            BodyKind::Empty => Ok(Some(HttpChunk::last_empty())),
            BodyKind::Length(_) => {
                if self.remaining == 0 {
                    return Ok(Some(HttpChunk::last_empty()));
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (buf.len() as u64).min(self.remaining) as usize;
                self.remaining -= take as u64;
                let data = buf.split_to(take).freeze();
                Ok(Some(HttpChunk::new(data, self.remaining == 0)))
            }
            BodyKind::UntilEof => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let data = buf.split().freeze();
                Ok(Some(HttpChunk::new(data, false)))
            }
            BodyKind::Chunked => self.decode_chunked(buf),
        }
    }

    fn decode_chunked(&mut self, buf: &mut BytesMut) -> Result<Option<HttpChunk>> {
        loop {
            match self.chunked {
                ChunkedState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let size = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size, 16)
                        .map_err(|_| Error::InvalidMessage(format!("bad chunk size {:?}", size)))?;
                    self.chunked = if size == 0 {
                        ChunkedState::Trailer
                    } else {
                        ChunkedState::Data(size)
                    };
                }
                ChunkedState::Data(left) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (buf.len() as u64).min(left) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = left - take as u64;
                    self.chunked = if left == 0 {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(left)
                    };
                    return Ok(Some(HttpChunk::new(data, false)));
                }
                ChunkedState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::InvalidMessage("missing CRLF after chunk data".to_string()));
                    }
                    buf.advance(2);
                    self.chunked = ChunkedState::Size;
                }
                ChunkedState::Trailer => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    // trailers are dropped
                    if line.is_empty() {
                        self.chunked = ChunkedState::Size;
                        return Ok(Some(HttpChunk::last_empty()));
                    }
                }
            }
        }
    }
}

fn take_line(buf: &mut BytesMut) -> Result<Option<String>> {
    let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
        if buf.len() > MAX_CHUNK_LINE {
            return Err(Error::InvalidMessage("chunk line too long".to_string()));
        }
        return Ok(None);
    };
    let line = buf.split_to(pos + 1);
    let line = std::str::from_utf8(&line)
        .map_err(|_| Error::InvalidMessage("chunk line is not utf-8".to_string()))?;
    Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()))
}

/// How outgoing body chunks are written for the message head just encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Nothing may follow the head; chunks are dropped.
    Suppressed,
    /// Chunks are written as-is.
    Raw,
    Chunked,
}

impl BodyEncoding {
    pub fn for_head<H: MessageHead>(head: &H, bodiless: bool) -> Self {
        if bodiless {
            BodyEncoding::Suppressed
        } else if head.is_chunked() {
            BodyEncoding::Chunked
        } else {
            BodyEncoding::Raw
        }
    }

    pub fn encode(&self, chunk: &HttpChunk, dst: &mut BytesMut) {
        match self {
            BodyEncoding::Suppressed => {}
            BodyEncoding::Raw => dst.extend_from_slice(&chunk.data),
            BodyEncoding::Chunked => {
                if !chunk.data.is_empty() {
                    dst.extend_from_slice(format!("{:x}\r\n", chunk.data.len()).as_bytes());
                    dst.extend_from_slice(&chunk.data);
                    dst.extend_from_slice(b"\r\n");
                }
                if chunk.last {
                    dst.extend_from_slice(b"0\r\n\r\n");
                }
            }
        }
    }
}

/// Fix the framing headers of an aggregated message before it is written.
pub fn frame_full_body(headers: &mut HeaderMap, len: usize, needs_length: bool) {
    headers.remove(header::TRANSFER_ENCODING);
    if len > 0 || needs_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len as u64));
    }
}

pub fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

pub fn version_from_minor(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

pub fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

pub fn headers_from_parsed(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = super::HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Error::InvalidMessage(format!("bad header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Error::InvalidMessage(format!("bad value for header {}", h.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}
