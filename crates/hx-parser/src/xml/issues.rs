//! Vulnerability report: `issues > issue > {name, host, path, ...,
//! requestresponse > {request, response}}`.

use super::{attr, Action, Event, Rule, Schema, TransitionTable};
use crate::http;
use crate::raw::RawCapture;
use hx_core::Origin;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Start,
    Issues,
    Issue,
    Field,
    Pair,
    PairField,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueField {
    Name,
    Host,
    Path,
    Severity,
    Confidence,
    Request,
    Response,
    /// End of a `requestresponse` element.
    PairDone,
}

fn rules() -> &'static [Rule<IssueState, IssueField>] {
    use IssueField as F;
    use IssueState::*;
    static RULES: OnceLock<Vec<Rule<IssueState, IssueField>>> = OnceLock::new();
    RULES.get_or_init(|| {
        let mut table = TransitionTable::new()
            .on(Start, Event::Start, "issues", Issues, Action::Skip)
            .on(Issues, Event::Start, "issue", Issue, Action::Begin)
            .on(Issue, Event::End, "issue", Issues, Action::Emit)
            .on(Issues, Event::End, "issues", Done, Action::Skip)
            .leaf(Issue, "name", Field, F::Name)
            .leaf(Issue, "host", Field, F::Host)
            .leaf(Issue, "path", Field, F::Path)
            .leaf(Issue, "severity", Field, F::Severity)
            .leaf(Issue, "confidence", Field, F::Confidence)
            .on(Issue, Event::Start, "requestresponse", Pair, Action::Skip)
            .on(Pair, Event::End, "requestresponse", Issue, Action::Store(F::PairDone))
            .leaf(Pair, "request", PairField, F::Request)
            .leaf(Pair, "response", PairField, F::Response)
            .skip_leaf(Pair, "responseRedirected", PairField);
        for tag in [
            "serialNumber",
            "type",
            "location",
            "issueBackground",
            "remediationBackground",
            "issueDetail",
            "remediationDetail",
            "references",
            "vulnerabilityClassifications",
        ] {
            table = table.skip_leaf(Issue, tag, Field);
        }
        table.build()
    })
}

#[derive(Debug, Default)]
struct Issue {
    name: String,
    host: Option<Vec<u8>>,
    ip: Option<Vec<u8>>,
    path: Option<String>,
    severity: String,
    confidence: String,
    request: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
    pairs: usize,
}

/// Scanner issue report, origin `SCANNER`. Each issue yields one record
/// built from its first request/response pair.
#[derive(Debug, Default)]
pub struct IssueReport {
    current: Option<Issue>,
}

impl IssueReport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

impl Schema for IssueReport {
    type State = IssueState;
    type Field = IssueField;

    const NAME: &'static str = "issue report";

    const ROOT: &'static str = "issues";

    fn initial(&self) -> IssueState {
        IssueState::Start
    }

    fn rules(&self) -> &'static [Rule<IssueState, IssueField>] {
        rules()
    }

    fn begin(&mut self) {
        self.current = Some(Issue::default());
    }

    fn store(&mut self, field: IssueField, value: Vec<u8>, attrs: &[(String, String)]) {
        let Some(issue) = self.current.as_mut() else {
            return;
        };
        match field {
            IssueField::Name => issue.name = text(&value),
            IssueField::Host => {
                issue.ip = attr(attrs, "ip").map(|ip| ip.trim().as_bytes().to_vec()).filter(|ip| !ip.is_empty());
                issue.host = Some(text(&value).into_bytes()).filter(|h| !h.is_empty());
            }
            IssueField::Path => issue.path = Some(text(&value)).filter(|p| !p.is_empty()),
            IssueField::Severity => issue.severity = text(&value),
            IssueField::Confidence => issue.confidence = text(&value),
            IssueField::Request if issue.pairs == 0 => issue.request = Some(value),
            IssueField::Response if issue.pairs == 0 => issue.response = Some(value),
            IssueField::Request | IssueField::Response => {}
            IssueField::PairDone => issue.pairs += 1,
        }
    }

    fn finish(&mut self) -> Option<RawCapture> {
        let issue = self.current.take()?;
        let mut raw = RawCapture::new(Origin::Scanner)
            .with_request(issue.request.as_deref().unwrap_or_default())
            .with_response(issue.response.as_deref().unwrap_or_default());

        // The host element carries the scheme, e.g. `https://shop.test`.
        if let Some(host) = issue.host.as_deref().map(String::from_utf8_lossy) {
            if http::is_absolute(&host) {
                let base = host.trim_end_matches('/');
                let path = issue.path.as_deref().unwrap_or("/");
                raw.url = Some(http::normalize_url(&format!("{base}{path}")).into_bytes());
                raw.host = http::host_of_url(&host).map(|h| h.as_bytes().to_vec());
            } else {
                raw.host = Some(host.as_bytes().to_vec());
            }
        }
        raw.hostip = issue.ip;
        raw.confirmed = Some(issue.confidence.eq_ignore_ascii_case("certain"));
        raw.notes = Some(format!("{} ({}, {})", issue.name, issue.severity, issue.confidence).into_bytes());
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlParser;

    const REPORT: &str = r#"<?xml version="1.0"?>
<issues burpVersion="1.7">
  <issue>
    <serialNumber>123</serialNumber>
    <type>1049088</type>
    <name>SQL injection</name>
    <host ip="10.0.0.7">https://shop.test</host>
    <path><![CDATA[/item]]></path>
    <location><![CDATA[/item [id parameter]]]></location>
    <severity>High</severity>
    <confidence>Certain</confidence>
    <issueBackground><![CDATA[<p>background</p>]]></issueBackground>
    <requestresponse>
      <request base64="true">R0VUIC9pdGVtP2lkPTEnIEhUVFAvMS4xDQpIb3N0OiBzaG9wLnRlc3QNCg0K</request>
      <response base64="true">SFRUUC8xLjEgNTAwIEVycm9yDQoNCm9vcHM=</response>
      <responseRedirected>false</responseRedirected>
    </requestresponse>
    <requestresponse>
      <request base64="true">UE9TVCAvc2Vjb25kIEhUVFAvMS4xDQoNCg==</request>
    </requestresponse>
  </issue>
  <issue>
    <name>Cookie without HttpOnly flag set</name>
    <host ip="">http://shop.test</host>
    <path>/</path>
    <severity>Low</severity>
    <confidence>Firm</confidence>
  </issue>
</issues>
"#;

    #[test]
    fn test_issue_records() {
        let records: Vec<RawCapture> = XmlParser::new(REPORT.as_bytes(), IssueReport::new())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);

        let sqli = &records[0];
        assert_eq!(sqli.origin, Origin::Scanner);
        assert_eq!(sqli.url.as_deref(), Some(&b"https://shop.test/item"[..]));
        assert_eq!(sqli.host.as_deref(), Some(&b"shop.test"[..]));
        assert_eq!(sqli.hostip.as_deref(), Some(&b"10.0.0.7"[..]));
        assert_eq!(sqli.method.as_deref(), Some(&b"GET"[..]));
        assert_eq!(sqli.request_headers, b"GET /item?id=1' HTTP/1.1\r\nHost: shop.test");
        assert_eq!(sqli.status.as_deref(), Some(&b"500"[..]));
        assert_eq!(sqli.response_body, b"oops");
        assert_eq!(sqli.notes.as_deref(), Some(&b"SQL injection (High, Certain)"[..]));
        assert_eq!(sqli.confirmed, Some(true));

        let cookie = &records[1];
        assert!(cookie.request_headers.is_empty());
        assert!(cookie.hostip.is_none());
        assert_eq!(cookie.url.as_deref(), Some(&b"http://shop.test/"[..]));
        assert_eq!(cookie.confirmed, Some(false));
    }
}
