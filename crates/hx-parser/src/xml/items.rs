//! Generic capture export: `items > item > {url, host, request, ...}`.

use super::{attr, Event, Rule, Schema, TransitionTable};
use crate::raw::RawCapture;
use crate::{datetime, http};
use hx_core::Origin;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Start,
    Items,
    Item,
    Field,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemField {
    Time,
    Url,
    Host,
    Port,
    Protocol,
    Method,
    Path,
    Request,
    Status,
    ResponseLength,
    MimeType,
    Response,
    Comment,
}

fn rules() -> &'static [Rule<ItemState, ItemField>] {
    use ItemField as F;
    use ItemState::*;
    static RULES: OnceLock<Vec<Rule<ItemState, ItemField>>> = OnceLock::new();
    RULES.get_or_init(|| {
        TransitionTable::new()
            .on(Start, Event::Start, "items", Items, super::Action::Skip)
            .on(Items, Event::Start, "item", Item, super::Action::Begin)
            .on(Item, Event::End, "item", Items, super::Action::Emit)
            .on(Items, Event::End, "items", Done, super::Action::Skip)
            .leaf(Item, "time", Field, F::Time)
            .leaf(Item, "url", Field, F::Url)
            .leaf(Item, "host", Field, F::Host)
            .leaf(Item, "port", Field, F::Port)
            .leaf(Item, "protocol", Field, F::Protocol)
            .leaf(Item, "method", Field, F::Method)
            .leaf(Item, "path", Field, F::Path)
            .skip_leaf(Item, "extension", Field)
            .leaf(Item, "request", Field, F::Request)
            .leaf(Item, "status", Field, F::Status)
            .leaf(Item, "responselength", Field, F::ResponseLength)
            .leaf(Item, "mimetype", Field, F::MimeType)
            .leaf(Item, "response", Field, F::Response)
            .leaf(Item, "comment", Field, F::Comment)
            .build()
    })
}

#[derive(Debug, Default)]
struct Item {
    raw: Option<RawCapture>,
    port: Option<u16>,
    protocol: Option<String>,
    path: Option<String>,
}

/// Items exported from a proxy's history or site map, origin `XML`.
#[derive(Debug, Default)]
pub struct ItemExport {
    current: Item,
}

impl ItemExport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

fn non_empty(value: Vec<u8>) -> Option<Vec<u8>> {
    (!value.iter().all(u8::is_ascii_whitespace)).then_some(value)
}

impl Schema for ItemExport {
    type State = ItemState;
    type Field = ItemField;

    const NAME: &'static str = "item export";

    const ROOT: &'static str = "items";

    fn initial(&self) -> ItemState {
        ItemState::Start
    }

    fn rules(&self) -> &'static [Rule<ItemState, ItemField>] {
        rules()
    }

    fn begin(&mut self) {
        self.current = Item {
            raw: Some(RawCapture::new(Origin::Xml)),
            ..Item::default()
        };
    }

    fn store(&mut self, field: ItemField, value: Vec<u8>, attrs: &[(String, String)]) {
        let item = &mut self.current;
        let Some(raw) = item.raw.as_mut() else {
            return;
        };
        match field {
            ItemField::Time => raw.datetime = Some(datetime::normalize(&text(&value))),
            ItemField::Url => raw.url = non_empty(value),
            ItemField::Host => {
                raw.hostip = attr(attrs, "ip").map(|ip| ip.as_bytes().to_vec()).and_then(non_empty);
                raw.host = non_empty(value);
            }
            ItemField::Port => item.port = text(&value).parse().ok(),
            ItemField::Protocol => item.protocol = Some(text(&value)).filter(|p| !p.is_empty()),
            ItemField::Method => raw.method = non_empty(value),
            ItemField::Path => item.path = Some(text(&value)).filter(|p| !p.is_empty()),
            ItemField::Request => {
                let (headers, body) = http::split_message(&value);
                raw.request_headers = headers.to_vec();
                raw.request_body = body.to_vec();
            }
            ItemField::Status => raw.status = non_empty(value),
            ItemField::ResponseLength => raw.content_length = text(&value).parse().ok(),
            ItemField::MimeType => raw.content_type = non_empty(value).filter(|m| m.contains(&b'/')),
            ItemField::Response => {
                let (headers, body) = http::split_response(&value);
                raw.response_headers = headers.to_vec();
                raw.response_body = body.to_vec();
            }
            ItemField::Comment => raw.notes = non_empty(value),
        }
    }

    fn finish(&mut self) -> Option<RawCapture> {
        let item = std::mem::take(&mut self.current);
        let mut raw = item.raw?;
        if raw.url.is_none() {
            if let (Some(protocol), Some(host)) = (&item.protocol, &raw.host) {
                let host = String::from_utf8_lossy(host);
                let path = item.path.as_deref().unwrap_or("/");
                raw.url = Some(http::build_url(protocol, host.trim(), item.port, path).into_bytes());
            }
        }
        raw.url = raw
            .url
            .take()
            .map(|u| http::normalize_url(String::from_utf8_lossy(&u).trim()).into_bytes());
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlParser;
    use hx_core::HxError;

    fn parse(xml: &str) -> Vec<hx_core::Result<RawCapture>> {
        XmlParser::new(xml.as_bytes(), ItemExport::new()).collect()
    }

    const EXPORT: &str = r#"<?xml version="1.0"?>
<!DOCTYPE items>
<items burpVersion="2.0" exportTime="Tue Mar 15 10:20:31 EDT 2016">
  <item>
    <time>Tue Mar 15 10:20:31 EDT 2016</time>
    <url><![CDATA[http://shop.test:80/cart?id=1]]></url>
    <host ip="10.0.0.7">shop.test</host>
    <port>80</port>
    <protocol>http</protocol>
    <method>GET</method>
    <path><![CDATA[/cart?id=1]]></path>
    <extension>null</extension>
    <request base64="true"><![CDATA[R0VUIC9jYXJ0P2lkPTEgSFRUUC8xLjENCkhvc3Q6IHNob3AudGVzdA0KDQo=]]></request>
    <status>200</status>
    <responselength>6</responselength>
    <mimetype>HTML</mimetype>
    <response base64="false">HTTP/1.1 200 OK&#x0d;&#x0a;Content-Type: text/html&#x0d;&#x0a;&#x0d;&#x0a;&lt;b&gt;&#xff;</response>
    <comment></comment>
  </item>
  <item>
    <host>api.test</host>
    <port>8443</port>
    <protocol>https</protocol>
    <path>/v1</path>
    <request>POST /v1 HTTP/1.1&#x0a;Host: api.test:8443&#x0a;&#x0a;{}</request>
    <response/>
  </item>
</items>
"#;

    #[test]
    fn test_items_in_document_order() {
        let records: Vec<RawCapture> = parse(EXPORT).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.origin, Origin::Xml);
        assert_eq!(first.url.as_deref(), Some(&b"http://shop.test/cart?id=1"[..]));
        assert_eq!(first.hostip.as_deref(), Some(&b"10.0.0.7"[..]));
        assert_eq!(first.datetime.as_deref(), Some("2016-03-15 10:20:31"));
        assert_eq!(first.request_headers, b"GET /cart?id=1 HTTP/1.1\r\nHost: shop.test");
        assert_eq!(first.response_headers, b"HTTP/1.1 200 OK\r\nContent-Type: text/html");
        assert_eq!(first.response_body, vec![b'<', b'b', b'>', 0xFF]);
        assert_eq!(first.content_type.as_deref(), Some(&b"text/html"[..]));
        assert_eq!(first.content_length, Some(6));
        assert!(first.notes.is_none());

        let second = &records[1];
        assert_eq!(second.url.as_deref(), Some(&b"https://api.test:8443/v1"[..]));
        assert_eq!(second.method.as_deref(), Some(&b"POST"[..]));
        assert_eq!(second.request_body, b"{}");
        assert!(second.response_headers.is_empty());
        assert!(second.status.is_none());
    }

    #[test]
    fn test_byte_escape_in_element_text() {
        let xml = "<items><item><request>&#x41;&#x42; / HTTP/1.1</request></item></items>";
        let records: Vec<RawCapture> = parse(xml).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(records[0].request_headers, b"AB / HTTP/1.1");
        assert_eq!(records[0].method.as_deref(), Some(&b"AB"[..]));
    }

    #[test]
    fn test_unknown_element_reports_state_event_tag() {
        let xml = "<items><item><cookie>x</cookie></item></items>";
        match parse(xml).pop() {
            Some(Err(HxError::UnexpectedEvent { state, event, tag })) => {
                assert_eq!(state, "Item");
                assert_eq!(event, "start");
                assert_eq!(tag, "cookie");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_truncation_is_fatal() {
        let xml = "<items><item><url>http://a.test/</url></item><item><url>http://b";
        let results = parse(xml);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(HxError::TruncatedInput { .. })));
    }

    #[test]
    fn test_empty_document_yields_nothing() {
        assert!(parse("<items/>").is_empty());
    }
}
