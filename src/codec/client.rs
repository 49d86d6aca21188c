//! Codec for the upstream side: encodes requests, decodes responses

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::body::{self, BodyDecoder, BodyEncoding, BodyKind};
use super::{
    HttpChunk, HttpFrame, HttpMessage, Method, RequestFrame, ResponseFrame, ResponseHead, StatusCode, MAX_HEADERS,
    MAX_HEAD_SIZE,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct HttpClientCodec {
    // methods of requests sent upstream, answered in order
    methods: VecDeque<Method>,
    body: Option<BodyDecoder>,
    encoding: Option<BodyEncoding>,
}

impl HttpClientCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests written that have not seen a final response yet.
    pub fn in_flight(&self) -> usize {
        self.methods.len()
    }

    /// No request awaiting an answer and no response body being read.
    pub fn is_idle(&self) -> bool {
        self.methods.is_empty() && self.body.is_none() && self.encoding.is_none()
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let len = match parsed.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(Error::InvalidMessage("response head too large".to_string()));
                }
                return Ok(None);
            }
        };

        let code = parsed.code.unwrap_or_default();
        let status = StatusCode::from_u16(code)
            .map_err(|_| Error::InvalidMessage(format!("bad status code {}", code)))?;
        let head = ResponseHead {
            version: body::version_from_minor(parsed.version),
            status,
            reason: parsed.reason.filter(|r| !r.is_empty()).map(str::to_string),
            headers: body::headers_from_parsed(parsed.headers)?,
        };

        let _ = buf.split_to(len);
        Ok(Some(head))
    }

    fn next_chunk(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseFrame>> {
        let Some(decoder) = self.body.as_mut() else {
            return Ok(None);
        };
        match decoder.decode(buf)? {
            Some(chunk) => {
                if chunk.last {
                    self.body = None;
                }
                Ok(Some(HttpFrame::Chunk(chunk)))
            }
            None => Ok(None),
        }
    }
}

impl Decoder for HttpClientCodec {
    type Item = ResponseFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseFrame>> {
        if self.body.is_some() {
            return self.next_chunk(buf);
        }

        let Some(head) = self.decode_head(buf)? else {
            return Ok(None);
        };
        // 101 ends the exchange; other 1xx precede the final response
        let method = if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            self.methods.front().cloned()
        } else {
            self.methods.pop_front()
        };
        let bodiless = method == Some(Method::HEAD)
            || !head.status_allows_body()
            || (method == Some(Method::CONNECT) && head.status.is_success());
        self.body = Some(BodyDecoder::new(BodyKind::for_response(&head, bodiless)?));
        Ok(Some(HttpFrame::Message(HttpMessage::streamed(head))))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseFrame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        match self.body.as_ref().map(BodyDecoder::kind) {
            Some(BodyKind::UntilEof) => {
                self.body = None;
                Ok(Some(HttpFrame::Chunk(HttpChunk::last_empty())))
            }
            None if buf.is_empty() => Ok(None),
            _ => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed mid-response",
            ))),
        }
    }
}

impl Encoder<RequestFrame> for HttpClientCodec {
    type Error = Error;

    fn encode(&mut self, frame: RequestFrame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            HttpFrame::Message(HttpMessage { mut head, body: full }) => {
                if let Some(data) = &full {
                    body::frame_full_body(&mut head.headers, data.len(), false);
                }

                dst.reserve(128);
                dst.put_slice(head.method.as_str().as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(head.uri.to_string().as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(body::version_str(head.version).as_bytes());
                dst.put_slice(b"\r\n");
                body::write_headers(&head.headers, dst);
                self.methods.push_back(head.method.clone());

                match full {
                    Some(data) => {
                        dst.extend_from_slice(&data);
                        self.encoding = None;
                    }
                    None => self.encoding = Some(BodyEncoding::for_head(&head, false)),
                }
                Ok(())
            }
            HttpFrame::Chunk(chunk) => {
                let encoding = self.encoding.ok_or_else(|| {
                    Error::InvalidMessage("request body chunk without a head".to_string())
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
    use crate::codec::{header, HeaderValue, MessageHead, RequestHead};

    fn send(codec: &mut HttpClientCodec, method: Method) {
        let mut head = RequestHead::new(method, "/".parse().unwrap());
        head.headers.insert(header::HOST, HeaderValue::from_static("origin"));
        let mut out = BytesMut::new();
        codec.encode(HttpFrame::Message(HttpMessage::streamed(head)), &mut out).unwrap();
        codec.encode(HttpFrame::Chunk(HttpChunk::last_empty()), &mut out).unwrap();
    }

    #[test]
    fn test_request_line_written_in_origin_form() {
        let mut codec = HttpClientCodec::new();
        let mut head = RequestHead::new(Method::POST, "/submit?x=1".parse().unwrap());
        head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(2u64));
        let mut out = BytesMut::new();
        codec.encode(HttpFrame::Message(HttpMessage::streamed(head)), &mut out).unwrap();
        codec.encode(HttpFrame::Chunk(HttpChunk::new(&b"ok"[..], true)), &mut out).unwrap();
        assert_eq!(&out[..], b"POST /submit?x=1 HTTP/1.1\r\ncontent-length: 2\r\n\r\nok");
        assert_eq!(codec.in_flight(), 1);
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut codec = HttpClientCodec::new();
        send(&mut codec, Method::HEAD);
        send(&mut codec, Method::GET);

        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"[..],
        );
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 4);
        assert!(matches!(&frames[1], HttpFrame::Chunk(c) if c.last && c.is_empty()));
        assert!(matches!(&frames[3], HttpFrame::Chunk(c) if c.last && &c.data[..] == b"hi"));
        assert_eq!(codec.in_flight(), 0);
    }

    #[test]
    fn test_informational_does_not_consume_request() {
        let mut codec = HttpClientCodec::new();
        send(&mut codec, Method::POST);
        let mut buf = BytesMut::from(&b"HTTP/1.1 100 Continue\r\n\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(HttpFrame::Message(_))));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(HttpFrame::Chunk(c)) if c.last));
        assert_eq!(codec.in_flight(), 1);
    }

    #[test]
    fn test_close_delimited_body_ends_at_eof() {
        let mut codec = HttpClientCodec::new();
        send(&mut codec, Method::GET);
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nstream"[..]);
        let head = codec.decode(&mut buf).unwrap();
        match head {
            Some(HttpFrame::Message(m)) => assert_eq!(m.head.content_length(), None),
            other => panic!("expected head, got {:?}", other),
        }
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(HttpFrame::Chunk(c)) if !c.last));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(codec.decode_eof(&mut buf).unwrap(), Some(HttpFrame::Chunk(c)) if c.last));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_truncated_length_body_fails_at_eof() {
        let mut codec = HttpClientCodec::new();
        send(&mut codec, Method::GET);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
        while codec.decode(&mut buf).unwrap().is_some() {}
        assert!(codec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn test_idle_only_after_response_body_ends() {
        let mut codec = HttpClientCodec::new();
        assert!(codec.is_idle());
        send(&mut codec, Method::GET);
        assert!(!codec.is_idle());

        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab"[..]);
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(HttpFrame::Message(_))));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(HttpFrame::Chunk(c)) if !c.last));
        assert!(!codec.is_idle());

        buf.extend_from_slice(b"cd");
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(HttpFrame::Chunk(c)) if c.last));
        assert!(codec.is_idle());
    }
}
