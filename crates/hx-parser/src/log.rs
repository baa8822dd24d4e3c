//! Parser for the delimited plaintext proxy log.
//!
//! Each transaction is a block opened by a line of 54 `=` and a marker line
//! carrying the time of day, the target origin and the peer address:
//!
//! ```text
//! ======================================================
//! 1:51:47 PM  https://shop.test:443  [10.0.0.7]
//! ======================================================
//! GET /cart HTTP/1.1
//! ...
//! ======================================================
//! HTTP/1.1 200 OK
//! ...
//! ======================================================
//! ```
//!
//! Body framing is recovered from the message headers since the log itself
//! does not record lengths.

use crate::raw::RawCapture;
use crate::traits::{CaptureFormat, CaptureStream};
use crate::{datetime, http};
use chrono::{Local, NaiveDateTime};
use hx_core::{Origin, Result};
use regex::bytes::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const DELIMITER_LEN: usize = 54;

fn marker_re() -> &'static Regex {
    static MARKER_RE: OnceLock<Regex> = OnceLock::new();
    MARKER_RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d{1,2}:\d{2}:\d{2}(?:\s*[AaPp][Mm])?)\s+([A-Za-z][A-Za-z0-9+.-]*)://([^\s/:\[\]]+)(?::(\d{1,5}))?\s*(?:\[([^\]]*)\])?\s*$",
        )
        .expect("valid log marker regex")
    })
}

/// Where block reading stopped when the input ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Delimiter,
    Marker,
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
}

/// Parsed block marker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub time: String,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub ip: Option<String>,
}

pub fn parse_marker(line: &[u8]) -> Option<Marker> {
    let caps = marker_re().captures(http::trim_eol(line))?;
    let text = |i: usize| caps.get(i).map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned());
    Some(Marker {
        time: text(1)?,
        scheme: text(2)?.to_ascii_lowercase(),
        host: text(3)?,
        port: text(4).and_then(|p| p.parse().ok()),
        ip: text(5).map(|ip| ip.trim().to_string()).filter(|ip| !ip.is_empty()),
    })
}

pub fn is_delimiter(line: &[u8]) -> bool {
    let line = http::trim_eol(line);
    line.len() == DELIMITER_LEN && line.iter().all(|&b| b == b'=')
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// True when the first non-blank line of `head` is a block delimiter.
pub fn looks_like_log(head: &[u8]) -> bool {
    head.split(|&b| b == b'\n')
        .find(|line| !is_blank(line))
        .map(is_delimiter)
        .unwrap_or(false)
}

/// Line reader with push-back.
struct LineSource<R> {
    inner: BufReader<R>,
    pushback: Vec<Vec<u8>>,
}

impl<R: Read> LineSource<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pushback: Vec::new(),
        }
    }

    /// Next line including its terminator; `None` at end of input.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(line) = self.pushback.pop() {
            return Ok(Some(line));
        }
        let mut line = Vec::new();
        let n = self.inner.read_until(b'\n', &mut line)?;
        Ok((n > 0).then_some(line))
    }

    fn unread(&mut self, line: Vec<u8>) {
        self.pushback.push(line);
    }

    /// Exactly `n` bytes, or `None` if the input ends first.
    fn read_exact_bytes(&mut self, n: u64) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(n.min(1 << 20) as usize);
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut line) = self.pushback.pop() else {
                break;
            };
            if line.len() as u64 > remaining {
                let rest = line.split_off(remaining as usize);
                self.pushback.push(rest);
            }
            remaining -= line.len() as u64;
            out.extend_from_slice(&line);
        }
        self.inner.by_ref().take(remaining).read_to_end(&mut out)?;
        Ok((out.len() as u64 == n).then_some(out))
    }
}

/// Header lines up to (not including) the blank separator line.
struct HeaderBlock {
    raw: Vec<u8>,
    separator: Option<Vec<u8>>,
}

impl HeaderBlock {
    fn headers(&self) -> &[u8] {
        http::trim_eol(&self.raw)
    }
}

fn read_header_block<R: Read>(src: &mut LineSource<R>, first: Vec<u8>) -> Result<Option<HeaderBlock>> {
    let mut raw = first;
    loop {
        let Some(line) = src.read_line()? else {
            return Ok(None);
        };
        if is_delimiter(&line) {
            src.unread(line);
            return Ok(Some(HeaderBlock { raw, separator: None }));
        }
        if http::trim_eol(&line).is_empty() {
            return Ok(Some(HeaderBlock { raw, separator: Some(line) }));
        }
        raw.extend_from_slice(&line);
    }
}

/// Lines up to the next delimiter (and, for requests, the next status line).
fn read_raw<R: Read>(src: &mut LineSource<R>, stop_at_status: bool) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(line) = src.read_line()? {
        if is_delimiter(&line) || (stop_at_status && line.starts_with(b"HTTP/")) {
            src.unread(line);
            break;
        }
        body.extend_from_slice(&line);
    }
    if is_blank(&body) {
        return Ok(Vec::new());
    }
    Ok(http::trim_eol(&body).to_vec())
}

fn read_chunked<R: Read>(src: &mut LineSource<R>, stop_at_status: bool) -> Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    loop {
        let Some(line) = src.read_line()? else {
            return Ok(None);
        };
        let size_line = String::from_utf8_lossy(http::trim_eol(&line)).into_owned();
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = match u64::from_str_radix(size_text, 16) {
            Ok(size) => size,
            Err(_) => {
                warn!(line = %size_line, decoded = body.len(), "unparseable chunk size, reading remainder raw");
                src.unread(line);
                body.extend(read_raw(src, stop_at_status)?);
                return Ok(Some(body));
            }
        };
        if size == 0 {
            while let Some(trailer) = src.read_line()? {
                if is_delimiter(&trailer) {
                    src.unread(trailer);
                    break;
                }
                if http::trim_eol(&trailer).is_empty() {
                    break;
                }
            }
            return Ok(Some(body));
        }
        let Some(chunk) = src.read_exact_bytes(size)? else {
            return Ok(None);
        };
        body.extend_from_slice(&chunk);
        match src.read_line()? {
            None => return Ok(None),
            Some(end) if http::trim_eol(&end).is_empty() => {}
            Some(residue) => {
                debug!(bytes = residue.len(), "chunk longer than declared size");
                src.unread(residue);
            }
        }
    }
}

enum Framing {
    Length(u64),
    Chunked,
    Raw,
}

fn framing(headers: &[u8]) -> Framing {
    if http::is_chunked(headers) {
        Framing::Chunked
    } else if let Some(n) = http::content_length(headers) {
        Framing::Length(n)
    } else {
        Framing::Raw
    }
}

fn read_body<R: Read>(src: &mut LineSource<R>, headers: &[u8], is_request: bool) -> Result<Option<Vec<u8>>> {
    match framing(headers) {
        Framing::Length(n) => src.read_exact_bytes(n),
        Framing::Chunked => read_chunked(src, is_request),
        Framing::Raw => read_raw(src, is_request).map(Some),
    }
}

/// First non-blank line, skipping at most one delimiter.
struct Lookahead {
    delimiter: Option<Vec<u8>>,
    line: Option<Vec<u8>>,
}

impl Lookahead {
    fn read<R: Read>(src: &mut LineSource<R>) -> Result<Self> {
        let mut delimiter = None;
        while let Some(line) = src.read_line()? {
            if is_blank(&line) {
                continue;
            }
            if delimiter.is_none() && is_delimiter(&line) {
                delimiter = Some(line);
                continue;
            }
            return Ok(Self { delimiter, line: Some(line) });
        }
        Ok(Self { delimiter, line: None })
    }

    fn push_back<R: Read>(self, src: &mut LineSource<R>) {
        if let Some(line) = self.line {
            src.unread(line);
        }
        if let Some(delimiter) = self.delimiter {
            src.unread(delimiter);
        }
    }
}

enum Block {
    Record(Box<RawCapture>),
    Skipped,
    End,
}

fn truncated(phase: Phase) -> Result<Block> {
    debug!(?phase, "log ended inside a block, dropping partial record");
    Ok(Block::End)
}

/// Scan forward to the next delimiter that is followed by a marker line.
fn next_marker<R: Read>(src: &mut LineSource<R>) -> Result<Option<Marker>> {
    let mut skipped = 0usize;
    loop {
        let Some(line) = src.read_line()? else {
            return Ok(None);
        };
        if !is_delimiter(&line) {
            if !is_blank(&line) {
                skipped += 1;
            }
            continue;
        }
        let Some(next) = src.read_line()? else {
            return Ok(None);
        };
        if let Some(marker) = parse_marker(&next) {
            if skipped > 0 {
                debug!(skipped, "resynchronized on block delimiter");
            }
            return Ok(Some(marker));
        }
        if is_delimiter(&next) {
            src.unread(next);
        }
    }
}

fn log_url(marker: &Marker, target: &str, method: &str) -> String {
    if http::is_absolute(target) {
        http::normalize_url(target)
    } else if method.eq_ignore_ascii_case("CONNECT") {
        http::normalize_url(&format!("{}://{}", marker.scheme, target))
    } else {
        http::normalize_url(&http::build_url(&marker.scheme, &marker.host, marker.port, target))
    }
}

fn read_block<R: Read>(src: &mut LineSource<R>, now: NaiveDateTime) -> Result<Block> {
    let Some(marker) = next_marker(src)? else {
        return Ok(Block::End);
    };

    let ahead = Lookahead::read(src)?;
    let Some(first) = ahead.line.as_deref() else {
        return truncated(Phase::Marker);
    };
    let Some(request_line) = http::parse_request_line(http::first_line(first)) else {
        debug!(host = %marker.host, "block without request line skipped");
        ahead.push_back(src);
        return Ok(Block::Skipped);
    };
    let Some(first) = ahead.line else {
        return truncated(Phase::Marker);
    };
    let Some(request) = read_header_block(src, first)? else {
        return truncated(Phase::RequestHeaders);
    };
    let request_body = if request.separator.is_some() {
        match read_body(src, request.headers(), true)? {
            Some(body) => body,
            None => return truncated(Phase::RequestBody),
        }
    } else {
        Vec::new()
    };

    let mut raw = RawCapture::new(Origin::Log);
    raw.request_headers = request.headers().to_vec();
    raw.request_body = request_body;
    raw.method = Some(request_line.method.clone().into_bytes());
    raw.url = Some(log_url(&marker, &request_line.target, &request_line.method).into_bytes());
    raw.host = Some(marker.host.clone().into_bytes());
    raw.hostip = marker.ip.clone().map(String::into_bytes);

    let ahead = Lookahead::read(src)?;
    let is_status = ahead
        .line
        .as_deref()
        .map(|l| http::parse_status_line(http::trim_eol(l)).is_some())
        .unwrap_or(false);
    if !is_status {
        if ahead.line.is_none() && ahead.delimiter.is_none() {
            return truncated(Phase::ResponseHeaders);
        }
        ahead.push_back(src);
        return Ok(finish(raw, &marker, now));
    }
    let Some(first) = ahead.line else {
        return truncated(Phase::ResponseHeaders);
    };
    let Some(mut response) = read_header_block(src, first)? else {
        return truncated(Phase::ResponseHeaders);
    };

    let interim = http::parse_status_line(http::first_line(&response.raw)).map(|s| s.code) == Some(100);
    if interim {
        if let Some(separator) = response.separator.take() {
            match src.read_line()? {
                Some(line) if http::parse_status_line(http::trim_eol(&line)).is_some() => {
                    let Some(final_block) = read_header_block(src, line)? else {
                        return truncated(Phase::ResponseHeaders);
                    };
                    let mut merged = std::mem::take(&mut response.raw);
                    merged.extend_from_slice(&separator);
                    merged.extend_from_slice(&final_block.raw);
                    response = HeaderBlock { raw: merged, separator: final_block.separator };
                }
                Some(line) => {
                    src.unread(line);
                    response.separator = Some(separator);
                }
                None => response.separator = Some(separator),
            }
        }
    }

    let no_body = request_line.method.eq_ignore_ascii_case("HEAD") || response.separator.is_none();
    let response_body = if no_body {
        Vec::new()
    } else {
        match read_body(src, response.headers(), false)? {
            Some(body) => body,
            None => return truncated(Phase::ResponseBody),
        }
    };
    raw.response_headers = response.headers().to_vec();
    raw.response_body = response_body;
    Ok(finish(raw, &marker, now))
}

fn finish(mut raw: RawCapture, marker: &Marker, now: NaiveDateTime) -> Block {
    raw.fill_missing_from_messages();
    let date_header = http::header_str(&raw.response_headers, "date");
    raw.datetime = Some(datetime::synthesize(&marker.time, date_header.as_deref(), now));
    Block::Record(Box::new(raw))
}

/// Lazy record stream over a delimited proxy log.
///
/// A log that ends inside a block ends iteration without error.
pub struct LogParser<R: Read> {
    source: Option<LineSource<R>>,
    now: NaiveDateTime,
}

impl LogParser<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening proxy log");
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read> LogParser<R> {
    pub fn new(inner: R) -> Self {
        Self {
            source: Some(LineSource::new(inner)),
            now: Local::now().naive_local(),
        }
    }

    /// Clock used to pick the calendar day of markers without a `Date`
    /// header.
    pub fn with_reference_time(mut self, now: NaiveDateTime) -> Self {
        self.now = now;
        self
    }
}

impl<R: Read> Iterator for LogParser<R> {
    type Item = Result<RawCapture>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let src = self.source.as_mut()?;
            match read_block(src, self.now) {
                Ok(Block::Record(raw)) => return Some(Ok(*raw)),
                Ok(Block::Skipped) => continue,
                Ok(Block::End) => {
                    self.source = None;
                    return None;
                }
                Err(e) => {
                    self.source = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Delimited plaintext proxy log.
pub struct LogFormat;

impl CaptureFormat for LogFormat {
    fn name(&self) -> &'static str {
        "log"
    }

    fn open(&self, path: &Path) -> Result<CaptureStream> {
        Ok(Box::new(LogParser::open(path)?))
    }

    fn supported_extensions(&self) -> Vec<String> {
        vec![".log".to_string(), ".txt".to_string()]
    }

    fn sniff(&self, head: &[u8]) -> bool {
        looks_like_log(head)
    }
}
