//! Codec for the client-facing side: decodes requests, encodes responses

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::body::{self, BodyDecoder, BodyEncoding, BodyKind};
use super::{HttpChunk, HttpFrame, HttpMessage, Method, RequestFrame, RequestHead, ResponseFrame, MAX_HEADERS, MAX_HEAD_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct HttpServerCodec {
    body: Option<BodyDecoder>,
    // methods of requests still waiting for a final response
    methods: VecDeque<Method>,
    encoding: Option<BodyEncoding>,
}

impl HttpServerCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a body frame that is already complete without reading more input.
    ///
    /// After a `CONNECT` head is decoded its empty terminating chunk is still
    /// pending; the caller uses this to consume it before dropping the codec.
    pub fn take_pending(&mut self) -> Option<HttpChunk> {
        let decoder = self.body.as_mut()?;
        let mut empty = BytesMut::new();
        match decoder.decode(&mut empty) {
            Ok(Some(chunk)) => {
                if chunk.last {
                    self.body = None;
                }
                Some(chunk)
            }
            _ => None,
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<RequestHead>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let len = match parsed.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(Error::InvalidMessage("request head too large".to_string()));
                }
                return Ok(None);
            }
        };

        let method = parsed.method.unwrap_or_default();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::MalformedRequest(format!("bad method {:?}", method)))?;
        let path = parsed.path.unwrap_or_default();
        let uri = path
            .parse()
            .map_err(|_| Error::MalformedRequest(format!("bad request target {:?}", path)))?;
        let head = RequestHead {
            method,
            uri,
            version: body::version_from_minor(parsed.version),
            headers: body::headers_from_parsed(parsed.headers)?,
        };

        let _ = buf.split_to(len);
        Ok(Some(head))
    }
}

impl Decoder for HttpServerCodec {
    type Item = RequestFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>> {
        if let Some(decoder) = self.body.as_mut() {
            return match decoder.decode(buf)? {
                Some(chunk) => {
                    if chunk.last {
                        self.body = None;
                    }
                    Ok(Some(HttpFrame::Chunk(chunk)))
                }
                None => Ok(None),
            };
        }

        let Some(head) = self.decode_head(buf)? else {
            return Ok(None);
        };
        let kind = if head.is_connect() {
            BodyKind::Empty
        } else {
            BodyKind::for_request(&head)?
        };
        self.body = Some(BodyDecoder::new(kind));
        self.methods.push_back(head.method.clone());
        Ok(Some(HttpFrame::Message(HttpMessage::streamed(head))))
    }
}

impl Encoder<ResponseFrame> for HttpServerCodec {
    type Error = Error;

    fn encode(&mut self, frame: ResponseFrame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            HttpFrame::Message(HttpMessage { mut head, body: full }) => {
                let informational = head.status.is_informational();
                let request_method = if informational {
                    self.methods.front().cloned()
                } else {
                    self.methods.pop_front()
                };
                let tunnel = request_method == Some(Method::CONNECT) && head.status.is_success();
                let bodiless = tunnel || request_method == Some(Method::HEAD) || !head.status_allows_body();

                if let Some(data) = &full {
                    body::frame_full_body(&mut head.headers, data.len(), !bodiless);
                }

                let reason = head
                    .reason
                    .as_deref()
                    .or_else(|| head.status.canonical_reason())
                    .unwrap_or("");
                dst.reserve(128);
                dst.put_slice(body::version_str(head.version).as_bytes());
                dst.put_slice(format!(" {} {}\r\n", head.status.as_u16(), reason).as_bytes());
                body::write_headers(&head.headers, dst);

                match full {
                    Some(data) => {
                        if !bodiless {
                            dst.extend_from_slice(&data);
                        }
                        self.encoding = None;
                    }
                    None => self.encoding = Some(BodyEncoding::for_head(&head, bodiless)),
                }
                Ok(())
            }
            HttpFrame::Chunk(chunk) => {
                let encoding = self.encoding.ok_or_else(|| {
                    Error::InvalidMessage("response body chunk without a head".to_string())
                })?;
                encoding.encode(&chunk, dst);
                if chunk.last {
                    self.encoding = None;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{header, HeaderValue, MessageHead, ResponseHead, StatusCode};
    use bytes::Bytes;

    fn decode_all(codec: &mut HttpServerCodec, buf: &mut BytesMut) -> Vec<RequestFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_bodiless_request_gets_terminating_chunk() {
        let mut codec = HttpServerCodec::new();
        let mut buf = BytesMut::from(&b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            HttpFrame::Message(m) => {
                assert_eq!(m.head.method, Method::GET);
                assert_eq!(m.head.header_str(&header::HOST), Some("example.com"));
                assert!(!m.is_full());
            }
            other => panic!("expected head, got {:?}", other),
        }
        assert!(matches!(&frames[1], HttpFrame::Chunk(c) if c.last && c.is_empty()));
    }

    #[test]
    fn test_pipelined_requests_with_bodies() {
        let mut codec = HttpServerCodec::new();
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabcPOST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nxy\r\n0\r\n\r\n"[..],
        );
        let frames = decode_all(&mut codec, &mut buf);
        let heads = frames.iter().filter(|f| matches!(f, HttpFrame::Message(_))).count();
        let ends = frames.iter().filter(|f| f.ends_message()).count();
        assert_eq!(heads, 2);
        assert_eq!(ends, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_connect_leaves_pending_chunk() {
        let mut codec = HttpServerCodec::new();
        let mut buf = BytesMut::from(&b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01"[..]);
        let head = codec.decode(&mut buf).unwrap();
        assert!(matches!(head, Some(HttpFrame::Message(ref m)) if m.head.is_connect()));

        let pending = codec.take_pending().expect("pending terminating chunk");
        assert!(pending.last);
        assert!(codec.take_pending().is_none());
        assert_eq!(&buf[..], b"\x16\x03\x01");
    }

    #[test]
    fn test_partial_head_waits() {
        let mut codec = HttpServerCodec::new();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_an_error() {
        let mut codec = HttpServerCodec::new();
        let mut buf = BytesMut::from(&b"\x16\x03\x01\x02\x00\r\n\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_head_response_body_is_suppressed() {
        let mut codec = HttpServerCodec::new();
        let mut buf = BytesMut::from(&b"HEAD / HTTP/1.1\r\nHost: a\r\n\r\n"[..]);
        decode_all(&mut codec, &mut buf);

        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mut out = BytesMut::new();
        codec.encode(HttpFrame::Message(HttpMessage::streamed(head)), &mut out).unwrap();
        codec.encode(HttpFrame::Chunk(HttpChunk::last_empty()), &mut out).unwrap();
        assert!(out.ends_with(b"\r\n\r\n"));
        assert!(!out.ends_with(b"0\r\n\r\n"));
    }

    #[test]
    fn test_full_response_gets_content_length() {
        let mut codec = HttpServerCodec::new();
        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mut out = BytesMut::new();
        codec
            .encode(HttpFrame::Message(HttpMessage::full(head, Bytes::from_static(b"hello"))), &mut out)
            .unwrap();
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_connection_established_reply() {
        let mut codec = HttpServerCodec::new();
        let mut out = BytesMut::new();
        codec
            .encode(HttpFrame::Message(HttpMessage::streamed(ResponseHead::connection_established())), &mut out)
            .unwrap();
        assert_eq!(&out[..], b"HTTP/1.1 200 Connection established\r\n\r\n");
    }
}
