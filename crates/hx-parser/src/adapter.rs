//! Conversion of parser output into the canonical [`Capture`].

use crate::http;
use crate::raw::RawCapture;
use encoding_rs::{Encoding, UTF_8};
use hx_core::{Capture, Extras, Message, Result};

fn encoding_for(content_type: Option<&[u8]>) -> &'static Encoding {
    content_type
        .map(String::from_utf8_lossy)
        .as_deref()
        .and_then(http::charset_of)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8)
}

fn decode(encoding: &'static Encoding, field: Option<Vec<u8>>) -> String {
    match field {
        Some(bytes) => {
            let (text, _, _) = encoding.decode(&bytes);
            text.trim().to_string()
        }
        None => String::new(),
    }
}

/// Build a [`Capture`] from a raw record.
///
/// Text fields are decoded with the charset named in the content type;
/// unknown charsets fall back to UTF-8 with replacement characters.
pub fn adapt(raw: RawCapture) -> Capture {
    let content_type = raw
        .content_type
        .clone()
        .or_else(|| http::header_value(&raw.response_headers, "content-type").map(<[u8]>::to_vec));
    let encoding = encoding_for(content_type.as_deref());

    let status = raw
        .status
        .as_deref()
        .and_then(|s| std::str::from_utf8(s).ok())
        .and_then(|s| s.trim().parse::<u16>().ok());

    Capture {
        origin: raw.origin,
        host: decode(encoding, raw.host),
        hostip: decode(encoding, raw.hostip),
        url: decode(encoding, raw.url),
        method: decode(encoding, raw.method),
        status,
        content_type: decode(encoding, content_type),
        datetime: raw.datetime.unwrap_or_default(),
        request: Message::new(raw.request_headers, raw.request_body),
        response: Message::new(raw.response_headers, raw.response_body),
        extras: Extras {
            notes: raw.notes.map(|n| decode(encoding, Some(n))).filter(|n| !n.is_empty()),
            confirmed: raw.confirmed,
            content_length: raw.content_length,
            elapsed: raw.elapsed,
        },
    }
}

/// Iterator adapter turning a parser's raw stream into captures.
pub struct Normalized<I> {
    inner: I,
}

impl<I> Iterator for Normalized<I>
where
    I: Iterator<Item = Result<RawCapture>>,
{
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| item.map(adapt))
    }
}

pub trait NormalizeExt: Iterator<Item = Result<RawCapture>> + Sized {
    fn normalized(self) -> Normalized<Self> {
        Normalized { inner: self }
    }
}

impl<I: Iterator<Item = Result<RawCapture>>> NormalizeExt for I {}
