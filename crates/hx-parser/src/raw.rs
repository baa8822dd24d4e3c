//! Format-neutral tuple produced by every parser before normalization.

use crate::{datetime, http};
use hx_core::Origin;

/// One transaction as read from a source file, before text decoding.
///
/// Text fields are kept as bytes so the adapter can decode them with the
/// charset of the captured response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub origin: Origin,
    pub host: Option<Vec<u8>>,
    pub hostip: Option<Vec<u8>>,
    pub url: Option<Vec<u8>>,
    pub method: Option<Vec<u8>>,
    pub status: Option<Vec<u8>>,
    pub content_type: Option<Vec<u8>>,
    /// Already normalized by the parser that knows the source format.
    pub datetime: Option<String>,
    pub request_headers: Vec<u8>,
    pub request_body: Vec<u8>,
    pub response_headers: Vec<u8>,
    pub response_body: Vec<u8>,
    pub notes: Option<Vec<u8>>,
    pub confirmed: Option<bool>,
    pub content_length: Option<u64>,
    pub elapsed: Option<u64>,
}

fn absent(field: &Option<Vec<u8>>) -> bool {
    field.as_ref().map_or(true, |v| v.iter().all(|b| b.is_ascii_whitespace()))
}

impl RawCapture {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            host: None,
            hostip: None,
            url: None,
            method: None,
            status: None,
            content_type: None,
            datetime: None,
            request_headers: Vec::new(),
            request_body: Vec::new(),
            response_headers: Vec::new(),
            response_body: Vec::new(),
            notes: None,
            confirmed: None,
            content_length: None,
            elapsed: None,
        }
    }

    /// Split and attach a raw request buffer.
    pub fn with_request(mut self, raw: &[u8]) -> Self {
        let (headers, body) = http::split_message(raw);
        self.request_headers = headers.to_vec();
        self.request_body = body.to_vec();
        self
    }

    /// Split (with 100-Continue folding) and attach a raw response buffer.
    pub fn with_response(mut self, raw: &[u8]) -> Self {
        let (headers, body) = http::split_response(raw);
        self.response_headers = headers.to_vec();
        self.response_body = body.to_vec();
        self
    }

    /// Re-derive absent structured fields from the embedded messages, using
    /// the request line, status line and well-known headers.
    pub fn fill_missing_from_messages(&mut self) {
        let request_line = http::parse_request_line(http::first_line(&self.request_headers));
        let host_header = http::header_str(&self.request_headers, "host");

        if absent(&self.method) {
            if let Some(line) = &request_line {
                self.method = Some(line.method.clone().into_bytes());
            }
        }
        if absent(&self.url) {
            if let Some(line) = &request_line {
                let url = if http::is_absolute(&line.target) {
                    Some(http::normalize_url(&line.target))
                } else if line.method.eq_ignore_ascii_case("CONNECT") {
                    Some(http::normalize_url(&format!("https://{}", line.target)))
                } else {
                    host_header.as_deref().map(|host| {
                        let scheme = if host.ends_with(":443") { "https" } else { "http" };
                        http::normalize_url(&http::build_url(scheme, host, None, &line.target))
                    })
                };
                self.url = url.map(String::into_bytes);
            }
        }
        if absent(&self.host) {
            let from_header = host_header.as_deref().map(|h| http::strip_port(h).to_string());
            let from_url = self
                .url
                .as_ref()
                .and_then(|u| http::host_of_url(&String::from_utf8_lossy(u)).map(str::to_string));
            self.host = from_header.or(from_url).map(String::into_bytes);
        }
        if absent(&self.status) {
            self.status = http::final_status(&self.response_headers).map(|c| c.to_string().into_bytes());
        }
        if absent(&self.content_type) {
            self.content_type = http::header_value(&self.response_headers, "content-type").map(<[u8]>::to_vec);
        }
        if self.datetime.as_deref().map_or(true, str::is_empty) {
            self.datetime = http::header_str(&self.response_headers, "date")
                .and_then(|d| datetime::parse_http_date(&d))
                .map(|d| datetime::format(d.naive_local()));
        }
        if self.content_length.is_none() && !self.response_headers.is_empty() {
            self.content_length = http::content_length(&self.response_headers)
                .or(Some(self.response_body.len() as u64));
        }
    }
}
