//! External scanner report: `XmlReport > Scan? > Issues > Issue > Variant`.

use super::{Action, Event, Rule, Schema, TransitionTable};
use crate::http;
use crate::raw::RawCapture;
use hx_core::Origin;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Start,
    Report,
    Scan,
    Issues,
    AfterIssues,
    Issue,
    IssueField,
    Variant,
    VariantField,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanField {
    Url,
    Entity,
    Severity,
    Difference,
    OriginalTraffic,
    TestTraffic,
    /// End of an `Issue` element.
    IssueDone,
}

fn rules() -> &'static [Rule<ScanState, ScanField>] {
    use ScanField as F;
    use ScanState::*;
    static RULES: OnceLock<Vec<Rule<ScanState, ScanField>>> = OnceLock::new();
    RULES.get_or_init(|| {
        TransitionTable::new()
            .on(Start, Event::Start, "XmlReport", Report, Action::Skip)
            .on(Report, Event::Start, "Scan", Scan, Action::Skip)
            .on(Report, Event::Start, "Issues", Issues, Action::Skip)
            .on(Scan, Event::Start, "Issues", Issues, Action::Skip)
            .on(Issues, Event::End, "Issues", AfterIssues, Action::Skip)
            .on(AfterIssues, Event::End, "Scan", Report, Action::Skip)
            .on(AfterIssues, Event::End, "XmlReport", Done, Action::Skip)
            .on(Report, Event::End, "XmlReport", Done, Action::Skip)
            .on(Issues, Event::Start, "Issue", Issue, Action::Skip)
            .on(Issue, Event::End, "Issue", Issues, Action::Store(F::IssueDone))
            .leaf(Issue, "Url", IssueField, F::Url)
            .leaf(Issue, "Entity", IssueField, F::Entity)
            .leaf(Issue, "Severity", IssueField, F::Severity)
            .on(Issue, Event::Start, "Variant", Variant, Action::Begin)
            .on(Variant, Event::End, "Variant", Issue, Action::Emit)
            .leaf(Variant, "Difference", VariantField, F::Difference)
            .skip_leaf(Variant, "Comments", VariantField)
            .leaf(Variant, "OriginalHttpTraffic", VariantField, F::OriginalTraffic)
            .leaf(Variant, "TestHttpTraffic", VariantField, F::TestTraffic)
            .build()
    })
}

/// Split `request + response` traffic at the first status line following
/// the request header block.
pub fn split_traffic(traffic: &[u8]) -> (&[u8], &[u8]) {
    let Some((pos, width)) = http::boundary(traffic) else {
        return (traffic, &[]);
    };
    let after = pos + width;
    let rest = &traffic[after..];
    let start = if rest.starts_with(b"HTTP/") {
        Some(0)
    } else {
        http::find(rest, b"\nHTTP/").map(|p| p + 1)
    };
    match start {
        Some(0) => (&traffic[..after], rest),
        Some(start) => (http::trim_eol(&traffic[..after + start]), &rest[start..]),
        None => (traffic, &[]),
    }
}

#[derive(Debug, Default)]
struct IssueContext {
    url: String,
    entity: String,
    severity: String,
}

#[derive(Debug, Default)]
struct Variant {
    difference: String,
    original: Vec<u8>,
    test: Vec<u8>,
}

/// External scanner report, origin `VARIANT`. Each test variant of an
/// issue yields one record; structured fields are recovered from the
/// recorded traffic.
#[derive(Debug, Default)]
pub struct ScanReport {
    issue: IssueContext,
    variant: Option<Variant>,
}

impl ScanReport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

impl Schema for ScanReport {
    type State = ScanState;
    type Field = ScanField;

    const NAME: &'static str = "scan report";

    const ROOT: &'static str = "XmlReport";

    fn initial(&self) -> ScanState {
        ScanState::Start
    }

    fn rules(&self) -> &'static [Rule<ScanState, ScanField>] {
        rules()
    }

    fn begin(&mut self) {
        self.variant = Some(Variant::default());
    }

    fn store(&mut self, field: ScanField, value: Vec<u8>, _attrs: &[(String, String)]) {
        match field {
            ScanField::Url => self.issue.url = text(&value),
            ScanField::Entity => self.issue.entity = text(&value),
            ScanField::Severity => self.issue.severity = text(&value),
            ScanField::IssueDone => self.issue = IssueContext::default(),
            ScanField::Difference | ScanField::OriginalTraffic | ScanField::TestTraffic => {
                let Some(variant) = self.variant.as_mut() else {
                    return;
                };
                match field {
                    ScanField::Difference => variant.difference = text(&value),
                    ScanField::OriginalTraffic => variant.original = value,
                    _ => variant.test = value,
                }
            }
        }
    }

    fn finish(&mut self) -> Option<RawCapture> {
        let variant = self.variant.take()?;
        let traffic = if variant.test.iter().all(u8::is_ascii_whitespace) {
            variant.original
        } else {
            variant.test
        };
        let traffic = trim_leading_blank_lines(&traffic);
        let (request, response) = split_traffic(traffic);
        let mut raw = RawCapture::new(Origin::Variant)
            .with_request(request)
            .with_response(response);
        let notes: Vec<&str> = [&self.issue.url, &self.issue.entity, &variant.difference]
            .into_iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        raw.notes = (!notes.is_empty()).then(|| notes.join(" | ").into_bytes());
        Some(raw)
    }
}

fn trim_leading_blank_lines(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(buf.len());
    &buf[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlParser;
    use hx_core::HxError;

    const REPORT: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>
<XmlReport>
  <Scan>
    <Issues>
      <Issue IssueTypeID=\"xss\">
        <Url>http://shop.test/search</Url>
        <Entity>q</Entity>
        <Severity>High</Severity>
        <Variant ID=\"1\">
          <Difference>Parameter q manipulated</Difference>
          <Comments/>
          <OriginalHttpTraffic>GET /search?q=a HTTP/1.1&#x0a;Host: shop.test&#x0a;&#x0a;HTTP/1.1 200 OK&#x0a;&#x0a;a</OriginalHttpTraffic>
          <TestHttpTraffic>
GET /search?q=%3Cscript%3E HTTP/1.1&#x0a;Host: shop.test:80&#x0a;&#x0a;HTTP/1.1 200 OK&#x0a;Content-Type: text/html&#x0a;&#x0a;&lt;script&gt;</TestHttpTraffic>
        </Variant>
        <Variant ID=\"2\">
          <Difference>second</Difference>
          <OriginalHttpTraffic>POST /search HTTP/1.1&#x0a;Host: shop.test&#x0a;&#x0a;q=b&#x0a;HTTP/1.1 403 Forbidden&#x0a;&#x0a;</OriginalHttpTraffic>
          <TestHttpTraffic/>
        </Variant>
      </Issue>
    </Issues>
  </Scan>
</XmlReport>
";

    #[test]
    fn test_split_traffic() {
        let (req, resp) = split_traffic(b"POST / HTTP/1.1\r\nHost: a\r\n\r\nbody\r\nHTTP/1.1 200 OK\r\n\r\nok");
        assert_eq!(req, b"POST / HTTP/1.1\r\nHost: a\r\n\r\nbody");
        assert_eq!(resp, b"HTTP/1.1 200 OK\r\n\r\nok");

        let (req, resp) = split_traffic(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(req, b"GET / HTTP/1.1\r\n\r\n");
        assert!(resp.is_empty());
    }

    #[test]
    fn test_one_record_per_variant() {
        let records: Vec<RawCapture> = XmlParser::new(REPORT.as_bytes(), ScanReport::new())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.origin, Origin::Variant);
        assert_eq!(first.url.as_deref(), Some(&b"http://shop.test/search?q=%3Cscript%3E"[..]));
        assert_eq!(first.host.as_deref(), Some(&b"shop.test"[..]));
        assert_eq!(first.status.as_deref(), Some(&b"200"[..]));
        assert_eq!(first.content_type.as_deref(), Some(&b"text/html"[..]));
        assert_eq!(first.response_body, b"<script>");
        assert_eq!(
            first.notes.as_deref(),
            Some(&b"http://shop.test/search | q | Parameter q manipulated"[..])
        );

        let second = &records[1];
        assert_eq!(second.method.as_deref(), Some(&b"POST"[..]));
        assert_eq!(second.request_body, b"q=b");
        assert_eq!(second.status.as_deref(), Some(&b"403"[..]));
    }

    #[test]
    fn test_report_without_scan_wrapper() {
        let xml = "<XmlReport><Issues><Issue><Variant><TestHttpTraffic>GET /x HTTP/1.0&#x0a;&#x0a;</TestHttpTraffic></Variant></Issue></Issues></XmlReport>";
        let records: Vec<_> = XmlParser::new(xml.as_bytes(), ScanReport::new()).collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_ok());
    }

    #[test]
    fn test_unexpected_end_event() {
        let xml = "<XmlReport><Issues></XmlReport>";
        let err = XmlParser::new(xml.as_bytes(), ScanReport::new())
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, HxError::UnexpectedEvent { .. } | HxError::Xml(_)));
    }
}
