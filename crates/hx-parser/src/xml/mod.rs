//! Incremental XML parsing driven by per-schema transition tables.
//!
//! The driver pulls one quick-xml event at a time, looks up the rule for
//! `(state, event, tag)` in the schema's table and applies its action.
//! Records are finished by the schema and queued until the caller pulls
//! them, so memory stays bounded by one record.

pub mod issues;
pub mod items;
pub mod scan;

use crate::raw::RawCapture;
use crate::traits::{CaptureFormat, CaptureStream};
use base64::{engine::general_purpose, Engine as _};
use hx_core::{HxError, Result};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::Path;
use tracing::{debug, warn};

pub use issues::IssueReport;
pub use items::ItemExport;
pub use scan::ScanReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    End,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::End => "end",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<F> {
    Skip,
    /// Start a new record.
    Begin,
    /// Start buffering the element's text.
    Collect(F),
    /// Hand the buffered text to the record; empty when nothing was
    /// collected.
    Store(F),
    /// Finish the record and queue it.
    Emit,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule<S, F> {
    pub state: S,
    pub event: Event,
    pub tag: &'static str,
    pub next: S,
    pub action: Action<F>,
}

/// Builder for a schema's rule list.
pub struct TransitionTable<S, F> {
    rules: Vec<Rule<S, F>>,
}

impl<S: Copy, F: Copy> TransitionTable<S, F> {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn on(mut self, state: S, event: Event, tag: &'static str, next: S, action: Action<F>) -> Self {
        self.rules.push(Rule { state, event, tag, next, action });
        self
    }

    /// Text element under `parent` collected into `field`.
    pub fn leaf(self, parent: S, tag: &'static str, inside: S, field: F) -> Self {
        self.on(parent, Event::Start, tag, inside, Action::Collect(field))
            .on(inside, Event::End, tag, parent, Action::Store(field))
    }

    /// Element under `parent` whose content is ignored.
    pub fn skip_leaf(self, parent: S, tag: &'static str, inside: S) -> Self {
        self.on(parent, Event::Start, tag, inside, Action::Skip)
            .on(inside, Event::End, tag, parent, Action::Skip)
    }

    pub fn build(self) -> Vec<Rule<S, F>> {
        self.rules
    }
}

impl<S: Copy, F: Copy> Default for TransitionTable<S, F> {
    fn default() -> Self {
        Self::new()
    }
}

/// One XML document layout.
pub trait Schema {
    type State: Copy + Eq + fmt::Debug + Send + 'static;
    type Field: Copy + Eq + fmt::Debug + Send + 'static;

    const NAME: &'static str;

    /// Document element name.
    const ROOT: &'static str;

    fn initial(&self) -> Self::State;

    fn rules(&self) -> &'static [Rule<Self::State, Self::Field>];

    fn begin(&mut self);

    fn store(&mut self, field: Self::Field, value: Vec<u8>, attrs: &[(String, String)]);

    /// Complete the current record. `None` drops it.
    fn finish(&mut self) -> Option<RawCapture>;
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// `&#xHH;` with exactly two hex digits.
fn byte_escape(entity: &[u8]) -> Option<u8> {
    match entity {
        [b'&', b'#', b'x' | b'X', hi, lo, b';'] => {
            let hex = [*hi, *lo];
            u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()
        }
        _ => None,
    }
}

/// Offset of the `;` closing the entity that starts at `text[0]`. The
/// reference ends at the next `&`, `<` or whitespace, so a bare ampersand
/// never swallows a following escape.
fn entity_len(text: &[u8]) -> Option<usize> {
    text.iter()
        .take(16)
        .enumerate()
        .skip(1)
        .find(|&(_, &b)| matches!(b, b';' | b'&' | b'<') || b.is_ascii_whitespace())
        .and_then(|(pos, &b)| (b == b';').then_some(pos))
}

/// Unescape element text to raw bytes.
///
/// Two-digit hex character references are taken as single raw bytes so
/// binary content survives; every other entity goes through quick-xml.
pub fn decode_text(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'&' {
            if let Some(len) = entity_len(&raw[i..]) {
                let entity = &raw[i..=i + len];
                match byte_escape(entity) {
                    Some(byte) => out.push(byte),
                    None => {
                        let text = String::from_utf8_lossy(entity);
                        match quick_xml::escape::unescape(&text) {
                            Ok(unescaped) => out.extend_from_slice(unescaped.as_bytes()),
                            Err(_) => out.extend_from_slice(entity),
                        }
                    }
                }
                i += len + 1;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

enum Segment {
    Escaped(Vec<u8>),
    Verbatim(Vec<u8>),
}

struct Collecting<F> {
    field: F,
    attrs: Vec<(String, String)>,
    segments: Vec<Segment>,
}

impl<F> Collecting<F> {
    fn is_base64(&self) -> bool {
        attr(&self.attrs, "base64").map_or(false, |v| v.eq_ignore_ascii_case("true"))
            || attr(&self.attrs, "encoding").map_or(false, |v| v.eq_ignore_ascii_case("base64"))
    }

    fn value(&self) -> Vec<u8> {
        let mut text = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Escaped(raw) => text.extend(decode_text(raw)),
                Segment::Verbatim(raw) => text.extend_from_slice(raw),
            }
        }
        if !self.is_base64() {
            return text;
        }
        let compact: Vec<u8> = text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        match general_purpose::STANDARD.decode(&compact) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "invalid base64 element text, keeping raw bytes");
                text
            }
        }
    }
}

/// Owned copy of a quick-xml event, so the read buffer can be reused.
enum Pulled {
    Start(String, Vec<(String, String)>),
    Empty(String, Vec<(String, String)>),
    End(String),
    Text(Vec<u8>),
    CData(Vec<u8>),
    Eof,
    Other,
}

fn element(e: &BytesStart<'_>) -> Result<(String, Vec<(String, String)>)> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for a in e.attributes() {
        let a = a.map_err(|err| HxError::Xml(format!("attribute of <{name}>: {err}")))?;
        let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
        let value = a
            .unescape_value()
            .map_err(|err| HxError::Xml(format!("attribute {key} of <{name}>: {err}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok((name, attrs))
}

/// Lazy record stream over one XML document.
///
/// Unlike the binary and log formats, a document that ends with elements
/// still open is an error.
pub struct XmlParser<R: BufRead, S: Schema> {
    reader: Option<Reader<R>>,
    buf: Vec<u8>,
    schema: S,
    state: S::State,
    open: Vec<String>,
    collecting: Option<Collecting<S::Field>>,
    queue: VecDeque<RawCapture>,
}

impl<S: Schema> XmlParser<BufReader<File>, S> {
    pub fn open(path: impl AsRef<Path>, schema: S) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), schema = S::NAME, "opening XML export");
        Ok(Self::new(BufReader::new(File::open(path)?), schema))
    }
}

impl<R: BufRead, S: Schema> XmlParser<R, S> {
    pub fn new(inner: R, schema: S) -> Self {
        let state = schema.initial();
        Self {
            reader: Some(Reader::from_reader(inner)),
            buf: Vec::new(),
            schema,
            state,
            open: Vec::new(),
            collecting: None,
            queue: VecDeque::new(),
        }
    }

    fn read(&mut self) -> Result<Pulled> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Pulled::Eof);
        };
        self.buf.clear();
        let pulled = match reader.read_event_into(&mut self.buf) {
            Ok(XmlEvent::Start(e)) => {
                let (name, attrs) = element(&e)?;
                Pulled::Start(name, attrs)
            }
            Ok(XmlEvent::Empty(e)) => {
                let (name, attrs) = element(&e)?;
                Pulled::Empty(name, attrs)
            }
            Ok(XmlEvent::End(e)) => Pulled::End(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
            Ok(XmlEvent::Text(t)) => Pulled::Text(t.into_inner().into_owned()),
            Ok(XmlEvent::CData(c)) => Pulled::CData(c.into_inner().into_owned()),
            Ok(XmlEvent::Eof) => Pulled::Eof,
            Ok(_) => Pulled::Other,
            Err(quick_xml::Error::UnexpectedEof(what)) => {
                return Err(HxError::TruncatedInput {
                    context: format!("{} ended inside {what}", S::NAME),
                })
            }
            Err(e) => {
                let position = reader.buffer_position();
                return Err(HxError::Xml(format!("{} at byte {position}: {e}", S::NAME)));
            }
        };
        Ok(pulled)
    }

    fn dispatch(&mut self, event: Event, tag: &str, attrs: Vec<(String, String)>) -> Result<()> {
        let rule = self
            .schema
            .rules()
            .iter()
            .find(|r| r.state == self.state && r.event == event && r.tag == tag)
            .copied()
            .ok_or_else(|| HxError::UnexpectedEvent {
                state: format!("{:?}", self.state),
                event: event.to_string(),
                tag: tag.to_string(),
            })?;
        self.state = rule.next;
        match rule.action {
            Action::Skip => {}
            Action::Begin => self.schema.begin(),
            Action::Collect(field) => {
                self.collecting = Some(Collecting {
                    field,
                    attrs,
                    segments: Vec::new(),
                })
            }
            Action::Store(field) => {
                let collected = self.collecting.take().filter(|c| c.field == field);
                let (value, attrs) = match collected {
                    Some(c) => (c.value(), c.attrs),
                    None => (Vec::new(), Vec::new()),
                };
                self.schema.store(field, value, &attrs);
            }
            Action::Emit => {
                if let Some(mut raw) = self.schema.finish() {
                    raw.fill_missing_from_messages();
                    self.queue.push_back(raw);
                }
            }
        }
        Ok(())
    }

    fn text(&mut self, segment: Segment) {
        match self.collecting.as_mut() {
            Some(c) => c.segments.push(segment),
            None => {
                let (Segment::Escaped(bytes) | Segment::Verbatim(bytes)) = &segment;
                if !bytes.iter().all(u8::is_ascii_whitespace) {
                    debug!(state = ?self.state, bytes = bytes.len(), "ignoring text outside a field");
                }
            }
        }
    }

    /// Process one event. Returns `false` at end of document.
    fn pull(&mut self) -> Result<bool> {
        match self.read()? {
            Pulled::Start(name, attrs) => {
                self.dispatch(Event::Start, &name, attrs)?;
                self.open.push(name);
            }
            Pulled::Empty(name, attrs) => {
                self.dispatch(Event::Start, &name, attrs)?;
                self.dispatch(Event::End, &name, Vec::new())?;
            }
            Pulled::End(name) => {
                self.dispatch(Event::End, &name, Vec::new())?;
                self.open.pop();
            }
            Pulled::Text(raw) => self.text(Segment::Escaped(raw)),
            Pulled::CData(raw) => self.text(Segment::Verbatim(raw)),
            Pulled::Other => {}
            Pulled::Eof => {
                if let Some(open) = self.open.last() {
                    return Err(HxError::TruncatedInput {
                        context: format!("{} ended inside <{open}>", S::NAME),
                    });
                }
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<R: BufRead, S: Schema> Iterator for XmlParser<R, S> {
    type Item = Result<RawCapture>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(raw) = self.queue.pop_front() {
                return Some(Ok(raw));
            }
            self.reader.as_ref()?;
            match self.pull() {
                Ok(true) => {}
                Ok(false) => self.reader = None,
                Err(e) => {
                    self.reader = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Name of the document element, skipping the prolog.
pub fn root_element(head: &[u8]) -> Option<&str> {
    let mut rest = head;
    loop {
        let start = rest.iter().position(|&b| b == b'<')?;
        rest = &rest[start + 1..];
        match rest.first()? {
            b'?' | b'!' => continue,
            _ => {
                let end = rest
                    .iter()
                    .position(|&b| b.is_ascii_whitespace() || b == b'>' || b == b'/')
                    .unwrap_or(rest.len());
                return std::str::from_utf8(&rest[..end]).ok().filter(|n| !n.is_empty());
            }
        }
    }
}

/// File format for one XML schema.
pub struct XmlFormat<S> {
    schema: PhantomData<fn() -> S>,
}

impl<S> XmlFormat<S> {
    pub fn new() -> Self {
        Self { schema: PhantomData }
    }
}

impl<S> Default for XmlFormat<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Schema + Default + Send + 'static> CaptureFormat for XmlFormat<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn open(&self, path: &Path) -> Result<CaptureStream> {
        Ok(Box::new(XmlParser::open(path, S::default())?))
    }

    fn supported_extensions(&self) -> Vec<String> {
        vec![".xml".to_string()]
    }

    fn sniff(&self, head: &[u8]) -> bool {
        root_element(head) == Some(S::ROOT)
    }
}
