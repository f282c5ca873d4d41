// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The JSON record pushed to Redis for every request

use chrono::{Local, SecondsFormat};
use http::{header, HeaderMap};
use pandora_module_utils::pingora::{SessionWrapper, SocketAddr};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// HTTP headers, keyed by lower-case header name. Values that aren't valid UTF-8 are converted
/// lossily.
pub type Headers = BTreeMap<String, Vec<String>>;

fn convert_headers(headers: &HeaderMap) -> Headers {
    let mut result = Headers::new();
    for (name, value) in headers {
        result
            .entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    result
}

/// TLS parameters of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsInfo {
    /// TLS protocol version, e.g. `TLSv1.3`
    pub version: String,
    /// Negotiated cipher suite
    pub cipher_suite: String,
}

/// Request part of the record, captured before other handlers can modify the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    /// IP address of the peer, or the socket path for Unix connections
    pub remote_ip: String,
    /// Port of the peer, empty for Unix connections
    pub remote_port: String,
    /// Value of the `X-Forwarded-For` header
    pub client_ip: String,
    /// HTTP version, e.g. `HTTP/1.1`
    pub proto: String,
    /// Request method
    pub method: String,
    /// Requested host
    pub host: String,
    /// Request URI including the query string
    pub uri: String,
    /// Request headers
    pub headers: Headers,
    /// TLS parameters, only present for TLS connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsInfo>,
}

impl RequestInfo {
    /// Extracts the request information from the session.
    pub fn capture(session: &impl SessionWrapper) -> Self {
        let (remote_ip, remote_port) = match session.client_addr() {
            Some(SocketAddr::Inet(addr)) => (addr.ip().to_string(), addr.port().to_string()),
            Some(SocketAddr::Unix(addr)) => (
                addr.as_pathname()
                    .map(|path| path.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                String::new(),
            ),
            None => (String::new(), String::new()),
        };

        let header = session.req_header();
        let client_ip = header
            .headers
            .get("x-forwarded-for")
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default();

        // Original URI is stored in extensions if some module rewrote the request
        let uri = session
            .original_uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .to_owned();

        let tls = session
            .digest()
            .and_then(|digest| digest.ssl_digest.as_ref())
            .map(|ssl| TlsInfo {
                version: ssl.version.to_owned(),
                cipher_suite: ssl.cipher.to_owned(),
            });

        Self {
            remote_ip,
            remote_port,
            client_ip,
            proto: format!("{:?}", header.version),
            method: header.method.as_str().to_owned(),
            host: session
                .host()
                .map(|host| host.into_owned())
                .unwrap_or_default(),
            uri,
            headers: convert_headers(&header.headers),
            tls,
        }
    }

    /// Value of the request’s `Content-Length` header, `0` if missing or invalid.
    pub fn content_length(session: &impl SessionWrapper) -> u64 {
        session
            .req_header()
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// A complete request record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Local time the record was created, RFC 3339 with nanoseconds
    pub ts: String,
    /// Request information
    pub request: RequestInfo,
    /// Declared request body size
    pub bytes_read: u64,
    /// Time in seconds it took to process the request
    pub duration: f64,
    /// Number of response body bytes sent
    pub size: usize,
    /// Response status code, `0` if no response was sent
    pub status: u16,
    /// Response headers
    pub resp_headers: Headers,
    /// Request body if enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
}

impl LogEntry {
    /// Completes the request information with the response data from the session.
    pub fn new(
        session: &impl SessionWrapper,
        request: RequestInfo,
        bytes_read: u64,
        duration: Duration,
        request_body: Option<String>,
    ) -> Self {
        let (status, resp_headers) = match session.response_written() {
            Some(response) => (response.status.as_u16(), convert_headers(&response.headers)),
            None => (0, Headers::new()),
        };

        Self {
            ts: Local::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            request,
            bytes_read,
            duration: duration.as_secs_f64(),
            size: session.body_bytes_sent(),
            status,
            resp_headers,
            request_body,
        }
    }

    /// Serializes the record as compact JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
