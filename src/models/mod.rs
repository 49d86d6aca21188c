use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::codec::{MessageHead, RequestHead, ResponseHead};
use crate::proxy::target::TargetDescriptor;

// One request/response pair as seen by the intercept chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeLog {
    pub client_addr: SocketAddr,
    pub method: String,
    pub uri: String,
    pub target: String,
    pub is_https: bool,

    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,

    pub request_content_length: Option<u64>,
    pub status_code: Option<u16>,
    pub response_content_length: Option<u64>,
}

impl ExchangeLog {
    pub fn from_request(client_addr: SocketAddr, target: &TargetDescriptor, head: &RequestHead) -> Self {
        Self {
            client_addr,
            method: head.method.to_string(),
            uri: head.uri.to_string(),
            target: target.authority(),
            is_https: target.tls,
            timestamp: Utc::now(),
            duration_ms: None,
            request_content_length: head.content_length(),
            status_code: None,
            response_content_length: None,
        }
    }

    pub fn complete(&mut self, head: &ResponseHead) {
        let elapsed = Utc::now().signed_duration_since(self.timestamp);
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
        self.status_code = Some(head.status.as_u16());
        self.response_content_length = head.content_length();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{header, HeaderValue, Method, StatusCode};

    #[test]
    fn test_exchange_records_declared_lengths() {
        let mut request = RequestHead::new(Method::POST, "/submit".parse().unwrap());
        request.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        let target = TargetDescriptor::new("example.com", 443, true);

        let mut entry = ExchangeLog::from_request("127.0.0.1:5000".parse().unwrap(), &target, &request);
        assert_eq!(entry.method, "POST");
        assert_eq!(entry.request_content_length, Some(12));
        assert!(entry.is_https);

        let mut response = ResponseHead::new(StatusCode::CREATED);
        response.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        entry.complete(&response);
        assert_eq!(entry.status_code, Some(201));
        assert_eq!(entry.response_content_length, Some(3));
        assert!(entry.duration_ms.is_some());
    }
}
