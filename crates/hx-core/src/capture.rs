use serde::{Deserialize, Serialize};
use std::fmt;

/// Source format (or sub-section of a format) a capture came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    Log,
    Xml,
    State,
    Proxy,
    Scanner,
    Target,
    Repeater,
    Variant,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Xml => "XML",
            Self::State => "STATE",
            Self::Proxy => "PROXY",
            Self::Scanner => "SCANNER",
            Self::Target => "TARGET",
            Self::Repeater => "REPEATER",
            Self::Variant => "VARIANT",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of an HTTP exchange, split at the header/body boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub headers: Vec<u8>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(headers: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: headers.into(),
            body: body.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.body.is_empty()
    }
}

/// Optional per-capture metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// Round-trip time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<u64>,
}

/// Canonical record of one HTTP request/response transaction.
///
/// Built in one piece by the normalization adapter and handed to storage by
/// value. String fields are never null; an unknown value is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub origin: Origin,
    pub host: String,
    pub hostip: String,
    pub url: String,
    pub method: String,
    pub status: Option<u16>,
    pub content_type: String,
    /// `YYYY-MM-DD HH:MM:SS`, or empty when the source had no usable time.
    pub datetime: String,
    pub request: Message,
    pub response: Message,
    pub extras: Extras,
}

impl Capture {
    /// Empty capture of the given origin; used as the base for building one.
    pub fn empty(origin: Origin) -> Self {
        Self {
            origin,
            host: String::new(),
            hostip: String::new(),
            url: String::new(),
            method: String::new(),
            status: None,
            content_type: String::new(),
            datetime: String::new(),
            request: Message::default(),
            response: Message::default(),
            extras: Extras::default(),
        }
    }
}
