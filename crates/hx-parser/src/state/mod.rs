//! Parser for the zip-contained tagged binary state format.

pub mod archive;
pub mod token;

use crate::raw::RawCapture;
use crate::traits::{CaptureFormat, CaptureStream};
use crate::{datetime, http};
use hx_core::{HxError, Origin, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;
use token::{Tag, TokenReader};
use tracing::debug;

/// Where the parser is in the tag grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    Version,
    State,
    Config,
    Target,
    Proxy,
    Scanner,
    Repeater,
    Item,
    RequestPanel,
    Issue,
    RequestResponse,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Value type read after an opening leaf tag.
#[derive(Debug, Clone, Copy)]
enum Leaf {
    Int32,
    Int64,
    Bool,
    String,
    BinString,
}

#[derive(Debug)]
enum Value {
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

enum Step {
    Enter(StateKind),
    Field(Leaf),
}

/// Next move for an opening tag in a state; `None` is a grammar violation.
fn transition(state: StateKind, tag: &str) -> Option<Step> {
    use StateKind::*;
    let step = match (state, tag) {
        (Initial, "version") => Step::Field(Leaf::Int32),
        (Initial, "state") => Step::Enter(State),
        (State, "config") => Step::Enter(Config),
        (State, "target") => Step::Enter(Target),
        (State, "proxy") => Step::Enter(Proxy),
        (State, "scanner") => Step::Enter(Scanner),
        (State, "repeater") => Step::Enter(Repeater),
        (Config, _) => Step::Field(Leaf::String),
        (State | Target, "item") | (Proxy, "historyItem") => Step::Enter(Item),
        (Scanner, "issue") => Step::Enter(Issue),
        (Repeater, "requestPanel") => Step::Enter(RequestPanel),
        (Issue, "requestResponse") => Step::Enter(RequestResponse),
        (Item | RequestPanel | Issue, "host" | "ip" | "url" | "method" | "mimeType" | "comment") => {
            Step::Field(Leaf::String)
        }
        (Item | RequestPanel | Issue, "port" | "status") => Step::Field(Leaf::Int32),
        (Item | RequestPanel | Issue, "time" | "elapsed") => Step::Field(Leaf::Int64),
        (Item | RequestPanel | Issue, "https" | "highlight") => Step::Field(Leaf::Bool),
        (Item | RequestPanel | Issue | RequestResponse, "request" | "response") => Step::Field(Leaf::BinString),
        (Issue, "name" | "severity" | "confidence" | "detail") => Step::Field(Leaf::String),
        _ => return None,
    };
    Some(step)
}

/// Record under construction inside an item, history item, request panel or
/// issue.
#[derive(Debug, Default)]
struct Pending {
    host: Option<Vec<u8>>,
    ip: Option<Vec<u8>>,
    port: Option<u16>,
    https: Option<bool>,
    url: Option<Vec<u8>>,
    method: Option<Vec<u8>>,
    status: Option<i64>,
    mime_type: Option<Vec<u8>>,
    comment: Option<Vec<u8>>,
    time: Option<i64>,
    elapsed: Option<i64>,
    highlight: Option<bool>,
    request: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
    issue_name: Option<String>,
    severity: Option<String>,
    confidence: Option<String>,
    pairs_seen: usize,
}

impl Pending {
    fn set(&mut self, state: StateKind, field: &str, value: Value) {
        let text = |v: &Value| match v {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        };
        let int = |v: &Value| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        };
        let flag = |v: &Value| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        };
        if state == StateKind::RequestResponse {
            // Only the first pair of an issue is kept.
            if self.pairs_seen > 1 {
                return;
            }
        }
        match field {
            "host" => self.host = text(&value),
            "ip" => self.ip = text(&value),
            "port" => self.port = int(&value).and_then(|p| u16::try_from(p).ok()),
            "https" => self.https = flag(&value),
            "url" => self.url = text(&value),
            "method" => self.method = text(&value),
            "status" => self.status = int(&value),
            "mimeType" => self.mime_type = text(&value),
            "comment" => self.comment = text(&value),
            "time" => self.time = int(&value),
            "elapsed" => self.elapsed = int(&value),
            "highlight" => self.highlight = flag(&value),
            "request" if self.request.is_none() => self.request = text(&value),
            "response" if self.response.is_none() => self.response = text(&value),
            "name" => self.issue_name = text(&value).map(|b| String::from_utf8_lossy(&b).into_owned()),
            "severity" => self.severity = text(&value).map(|b| String::from_utf8_lossy(&b).into_owned()),
            "confidence" => self.confidence = text(&value).map(|b| String::from_utf8_lossy(&b).into_owned()),
            _ => {}
        }
    }

    /// Finished record, or `None` when the container held no request.
    fn finish(self, origin: Origin) -> Option<RawCapture> {
        let request = self.request?;
        let mut raw = RawCapture::new(origin)
            .with_request(&request)
            .with_response(self.response.as_deref().unwrap_or_default());

        let url = self.url.filter(|u| !u.is_empty()).or_else(|| {
            let host = String::from_utf8_lossy(self.host.as_deref()?).into_owned();
            let line = http::parse_request_line(http::first_line(&raw.request_headers))?;
            if http::is_absolute(&line.target) {
                return Some(line.target.into_bytes());
            }
            let scheme = if self.https.unwrap_or(false) { "https" } else { "http" };
            Some(http::build_url(scheme, &host, self.port, &line.target).into_bytes())
        });
        raw.url = url.map(|u| http::normalize_url(&String::from_utf8_lossy(&u)).into_bytes());
        raw.host = self.host;
        raw.hostip = self.ip;
        raw.method = self.method;
        raw.status = self.status.filter(|s| *s > 0).map(|s| s.to_string().into_bytes());
        raw.content_type = self.mime_type.filter(|m| m.contains(&b'/'));
        raw.datetime = self.time.and_then(datetime::from_epoch_millis);
        raw.elapsed = self.elapsed.and_then(|e| u64::try_from(e).ok());

        match self.issue_name {
            Some(name) => {
                let severity = self.severity.unwrap_or_default();
                let confidence = self.confidence.unwrap_or_default();
                raw.confirmed = Some(confidence.eq_ignore_ascii_case("certain"));
                raw.notes = Some(format!("{name} ({severity}, {confidence})").into_bytes());
            }
            None => {
                raw.confirmed = self.highlight;
                raw.notes = self.comment;
            }
        }
        raw.fill_missing_from_messages();
        Some(raw)
    }
}

struct Frame {
    kind: StateKind,
    tag: String,
    origin: Option<Origin>,
}

/// Lazy record stream over a tagged binary state stream.
///
/// Yields one [`RawCapture`] per record container that holds a request. A
/// stream that ends early, even in the middle of a token, ends iteration
/// quietly and drops the incomplete record. Grammar violations are
/// reported once, after which the iterator is exhausted.
pub struct StateParser<R: Read> {
    reader: Option<TokenReader<R>>,
    stack: Vec<Frame>,
    pending: Option<Pending>,
    version: Option<i32>,
}

impl StateParser<Box<dyn Read + Send>> {
    /// Open the state entry of a zip archive on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening state archive");
        Ok(Self::new(archive::open_entry(path)?))
    }
}

impl<R: Read> StateParser<R> {
    /// Parse an already-unwrapped tag stream.
    pub fn new(inner: R) -> Self {
        Self {
            reader: Some(TokenReader::new(inner)),
            stack: Vec::new(),
            pending: None,
            version: None,
        }
    }

    /// Format version, once the header has been read.
    pub fn version(&self) -> Option<i32> {
        self.version
    }

    fn state(&self) -> StateKind {
        self.stack.last().map_or(StateKind::Initial, |f| f.kind)
    }

    fn in_state(&self, err: HxError) -> HxError {
        match err {
            HxError::Structural { expected, actual, .. } => HxError::Structural {
                state: self.state().to_string(),
                expected,
                actual,
            },
            other => other,
        }
    }

    fn structural(&self, expected: impl Into<String>, actual: impl Into<String>) -> HxError {
        self.in_state(token::malformed(expected, actual))
    }

    fn reader(&mut self) -> Result<&mut TokenReader<R>> {
        self.reader
            .as_mut()
            .ok_or_else(|| HxError::Other(anyhow::anyhow!("state parser already finished")))
    }

    fn read_value(&mut self, leaf: Leaf) -> Result<Option<Value>> {
        let reader = self.reader()?;
        Ok(match leaf {
            Leaf::Int32 => reader.read_int32()?.map(|v| Value::Int(v as i64)),
            Leaf::Int64 => reader.read_int64()?.map(Value::Int),
            Leaf::Bool => reader.read_bool()?.map(Value::Bool),
            Leaf::String => reader.read_string()?.map(Value::Bytes),
            Leaf::BinString => reader.read_binstr()?.map(Value::Bytes),
        })
    }

    /// Read a leaf value and its matching close tag. `None` means the
    /// stream ended.
    fn read_leaf(&mut self, name: &str, leaf: Leaf) -> Result<Option<Value>> {
        let Some(value) = self.read_value(leaf).map_err(|e| self.in_state(e))? else {
            return Ok(None);
        };
        let close = self.reader()?.read_tag().map_err(|e| self.in_state(e))?;
        match close {
            None => Ok(None),
            Some(tag) if tag.closing && tag.name == name => Ok(Some(value)),
            Some(tag) => Err(self.structural(Tag::close(name).to_string(), tag.to_string())),
        }
    }

    fn open_tag(&mut self, name: String) -> Result<bool> {
        let state = self.state();
        let Some(step) = transition(state, &name) else {
            return Err(self.structural("known tag", format!("<{name}>")));
        };
        match step {
            Step::Enter(kind) => {
                let origin = match (state, kind) {
                    (StateKind::Target, StateKind::Item) => Some(Origin::Target),
                    (StateKind::Proxy, StateKind::Item) => Some(Origin::Proxy),
                    (StateKind::State, StateKind::Item) => Some(Origin::State),
                    (_, StateKind::RequestPanel) => Some(Origin::Repeater),
                    (_, StateKind::Issue) => Some(Origin::Scanner),
                    _ => None,
                };
                if origin.is_some() {
                    self.pending = Some(Pending::default());
                }
                if kind == StateKind::RequestResponse {
                    if let Some(p) = self.pending.as_mut() {
                        p.pairs_seen += 1;
                    }
                }
                self.stack.push(Frame { kind, tag: name, origin });
                Ok(true)
            }
            Step::Field(leaf) => {
                if state == StateKind::Initial {
                    self.stack.push(Frame { kind: StateKind::Version, tag: name.clone(), origin: None });
                }
                let value = self.read_leaf(&name, leaf)?;
                if state == StateKind::Initial {
                    self.stack.pop();
                }
                let Some(value) = value else {
                    return Ok(false);
                };
                match state {
                    StateKind::Initial => {
                        if let Value::Int(v) = value {
                            self.version = i32::try_from(v).ok();
                        }
                    }
                    StateKind::Config => debug!(field = %name, "skipping config entry"),
                    _ => {
                        if let Some(p) = self.pending.as_mut() {
                            p.set(state, &name, value);
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    fn close_tag(&mut self, name: String) -> Result<Option<RawCapture>> {
        let state = self.state();
        let Some(frame) = self.stack.pop() else {
            return Err(self.structural("opening tag", format!("</{name}>")));
        };
        if frame.tag != name {
            return Err(HxError::Structural {
                state: state.to_string(),
                expected: Tag::close(&frame.tag).to_string(),
                actual: format!("</{name}>"),
            });
        }
        let Some(origin) = frame.origin else {
            return Ok(None);
        };
        let record = self.pending.take().and_then(|p| p.finish(origin));
        if record.is_none() {
            debug!(container = %frame.tag, "record without request skipped");
        }
        Ok(record)
    }

    fn step(&mut self) -> Result<Option<RawCapture>> {
        loop {
            let Some(tag) = self.reader()?.read_tag().map_err(|e| self.in_state(e))? else {
                if !self.stack.is_empty() {
                    debug!(state = %self.state(), "state stream ended inside a container");
                }
                return Ok(None);
            };
            if tag.closing {
                if let Some(record) = self.close_tag(tag.name)? {
                    return Ok(Some(record));
                }
            } else if !self.open_tag(tag.name)? {
                return Ok(None);
            }
        }
    }
}

impl<R: Read> Iterator for StateParser<R> {
    type Item = Result<RawCapture>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.as_ref()?;
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(e) => {
                self.reader = None;
                Some(Err(e))
            }
        }
    }
}

/// Zip archive holding a tagged state stream.
pub struct StateFormat;

impl CaptureFormat for StateFormat {
    fn name(&self) -> &'static str {
        "state"
    }

    fn open(&self, path: &Path) -> Result<CaptureStream> {
        Ok(Box::new(StateParser::open(path)?))
    }

    fn supported_extensions(&self) -> Vec<String> {
        vec![".burp".to_string(), ".state".to_string()]
    }

    fn sniff(&self, head: &[u8]) -> bool {
        head.starts_with(b"PK\x03\x04")
    }
}

#[cfg(test)]
mod tests {
    use super::token::encode::*;
    use super::*;

    const REQ: &[u8] = b"GET /a?x=1 HTTP/1.1\r\nHost: shop.test\r\n\r\n";
    const RESP: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>";

    fn header(out: &mut Vec<u8>) {
        int32(out, "version", 1);
        tag(out, "state");
    }

    fn history_item(out: &mut Vec<u8>, path: &str) {
        tag(out, "historyItem");
        string(out, "host", b"shop.test");
        int32(out, "port", 443);
        boolean(out, "https", true);
        int64(out, "time", 1_300_000_000_000);
        boolean(out, "highlight", true);
        string(out, "request", format!("GET {path} HTTP/1.1\r\nHost: shop.test\r\n\r\n").as_bytes());
        string(out, "response", RESP);
        close(out, "historyItem");
    }

    fn parse(buf: &[u8]) -> Vec<Result<RawCapture>> {
        StateParser::new(buf).collect()
    }

    #[test]
    fn test_proxy_history_items() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "proxy");
        history_item(&mut buf, "/one");
        history_item(&mut buf, "/two");
        close(&mut buf, "proxy");
        close(&mut buf, "state");

        let records: Vec<RawCapture> = parse(&buf).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].origin, Origin::Proxy);
        assert_eq!(records[0].url.as_deref(), Some(&b"https://shop.test/one"[..]));
        assert_eq!(records[1].url.as_deref(), Some(&b"https://shop.test/two"[..]));
        assert_eq!(records[0].method.as_deref(), Some(&b"GET"[..]));
        assert_eq!(records[0].status.as_deref(), Some(&b"200"[..]));
        assert_eq!(records[0].confirmed, Some(true));
        assert_eq!(records[0].datetime.as_deref(), Some("2011-03-13 07:06:40"));
        assert_eq!(records[0].response_body, b"<html>");
    }

    #[test]
    fn test_version_is_recorded() {
        let mut buf = Vec::new();
        header(&mut buf);
        close(&mut buf, "state");
        let mut parser = StateParser::new(&buf[..]);
        assert!(parser.next().is_none());
        assert_eq!(parser.version(), Some(1));
    }

    #[test]
    fn test_truncated_mid_record_keeps_complete_ones() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "proxy");
        history_item(&mut buf, "/one");
        let mut partial = Vec::new();
        history_item(&mut partial, "/two");
        buf.extend_from_slice(&partial[..partial.len() / 2]);

        let records = parse(&buf);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_ok());
    }

    #[test]
    fn test_truncated_mid_tag_is_benign() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "target");
        buf.extend_from_slice(b"<it");
        assert!(parse(&buf).is_empty());
    }

    #[test]
    fn test_mismatched_close_tag() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "proxy");
        tag(&mut buf, "historyItem");
        close(&mut buf, "proxy");

        let mut parser = StateParser::new(&buf[..]);
        match parser.next() {
            Some(Err(HxError::Structural { state, expected, actual })) => {
                assert_eq!(state, "Item");
                assert_eq!(expected, "</historyItem>");
                assert_eq!(actual, "</proxy>");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parser.next().is_none());
    }

    #[test]
    fn test_unknown_tag_is_structural() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "spider");
        let err = parse(&buf).pop().unwrap().unwrap_err();
        assert!(err.is_structural());
        assert!(err.to_string().contains("<spider>"));
    }

    #[test]
    fn test_leaf_close_mismatch() {
        let mut buf = Vec::new();
        tag(&mut buf, "version");
        buf.extend_from_slice(&1i32.to_be_bytes());
        close(&mut buf, "state");
        match parse(&buf).pop() {
            Some(Err(HxError::Structural { state, expected, .. })) => {
                assert_eq!(state, "Version");
                assert_eq!(expected, "</version>");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_issue_uses_first_pair() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "scanner");
        tag(&mut buf, "issue");
        string(&mut buf, "name", b"SQL injection");
        string(&mut buf, "severity", b"High");
        string(&mut buf, "confidence", b"Certain");
        string(&mut buf, "host", b"shop.test");
        tag(&mut buf, "requestResponse");
        string(&mut buf, "request", REQ);
        string(&mut buf, "response", RESP);
        close(&mut buf, "requestResponse");
        tag(&mut buf, "requestResponse");
        string(&mut buf, "request", b"POST /second HTTP/1.1\r\n\r\n");
        close(&mut buf, "requestResponse");
        close(&mut buf, "issue");
        close(&mut buf, "scanner");

        let records: Vec<RawCapture> = parse(&buf).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        let issue = &records[0];
        assert_eq!(issue.origin, Origin::Scanner);
        assert_eq!(issue.request_headers, b"GET /a?x=1 HTTP/1.1\r\nHost: shop.test");
        assert_eq!(issue.notes.as_deref(), Some(&b"SQL injection (High, Certain)"[..]));
        assert_eq!(issue.confirmed, Some(true));
        assert_eq!(issue.url.as_deref(), Some(&b"http://shop.test/a?x=1"[..]));
    }

    #[test]
    fn test_config_is_skipped_and_repeater_parsed() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "config");
        string(&mut buf, "name", b"proxy.listener");
        close(&mut buf, "config");
        tag(&mut buf, "repeater");
        tag(&mut buf, "requestPanel");
        string(&mut buf, "url", b"http://shop.test:80/r");
        string(&mut buf, "request", REQ);
        close(&mut buf, "requestPanel");
        tag(&mut buf, "requestPanel");
        close(&mut buf, "requestPanel");
        close(&mut buf, "repeater");
        close(&mut buf, "state");

        let records: Vec<RawCapture> = parse(&buf).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].origin, Origin::Repeater);
        assert_eq!(records[0].url.as_deref(), Some(&b"http://shop.test/r"[..]));
        assert!(records[0].status.is_none());
    }

    #[test]
    fn test_url_rebuilt_with_custom_port() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "target");
        tag(&mut buf, "item");
        string(&mut buf, "host", b"intra.test");
        int32(&mut buf, "port", 8080);
        boolean(&mut buf, "https", false);
        int32(&mut buf, "status", 404);
        string(&mut buf, "request", b"GET /x HTTP/1.0\r\n\r\n");
        close(&mut buf, "item");

        let records: Vec<RawCapture> = parse(&buf).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records[0].origin, Origin::Target);
        assert_eq!(records[0].url.as_deref(), Some(&b"http://intra.test:8080/x"[..]));
        assert_eq!(records[0].status.as_deref(), Some(&b"404"[..]));
    }

    #[test]
    fn test_item_outside_any_section() {
        let mut buf = Vec::new();
        header(&mut buf);
        tag(&mut buf, "item");
        string(&mut buf, "request", REQ);
        string(&mut buf, "response", RESP);
        close(&mut buf, "item");
        tag(&mut buf, "proxy");
        history_item(&mut buf, "/after");
        close(&mut buf, "proxy");
        close(&mut buf, "state");

        let records: Vec<RawCapture> = parse(&buf).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].origin, Origin::State);
        assert_eq!(records[0].url.as_deref(), Some(&b"http://shop.test/a?x=1"[..]));
        assert_eq!(records[1].origin, Origin::Proxy);
    }
}
