//! HTTP message grammar shared by every format parser.
//!
//! All helpers work on raw bytes: captured traffic is not guaranteed to be
//! valid UTF-8 and header/body boundaries must be byte exact.

/// Parsed `METHOD target VERSION` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

/// Parsed `HTTP/x.y NNN reason` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position and width of the first header/body separator.
pub fn boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|p| (p, 4));
    let lf = find(buf, b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Split a message at the first `\r\n\r\n` or `\n\n`.
///
/// Without a separator the whole buffer is headers and the body is empty.
pub fn split_message(buf: &[u8]) -> (&[u8], &[u8]) {
    match boundary(buf) {
        Some((pos, width)) => (&buf[..pos], &buf[pos + width..]),
        None => (buf, &[]),
    }
}

/// Split a response, folding `100 Continue` interim blocks into the headers.
///
/// The interim block and its separator stay as a prefix of the returned
/// headers; the body is whatever follows the final header block.
pub fn split_response(buf: &[u8]) -> (&[u8], &[u8]) {
    let mut offset = 0;
    loop {
        let rest = &buf[offset..];
        let Some((pos, width)) = boundary(rest) else {
            return (buf, &[]);
        };
        let interim = parse_status_line(first_line(&rest[..pos]))
            .map(|s| s.code == 100)
            .unwrap_or(false);
        if interim && pos + width < rest.len() {
            offset += pos + width;
            continue;
        }
        return (&buf[..offset + pos], &buf[offset + pos + width..]);
    }
}

pub fn first_line(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
    trim_eol(&buf[..end])
}

pub(crate) fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

pub fn parse_request_line(line: &[u8]) -> Option<RequestLine> {
    let text = String::from_utf8_lossy(trim_ascii(line));
    let mut parts = text.split_whitespace();
    let method = parts.next()?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-' || b == b'_') {
        return None;
    }
    let target = parts.next()?;
    let version = parts.next().unwrap_or("");
    Some(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

pub fn parse_status_line(line: &[u8]) -> Option<StatusLine> {
    let text = String::from_utf8_lossy(trim_ascii(line));
    if !text.starts_with("HTTP/") {
        return None;
    }
    let mut parts = text.splitn(3, ' ');
    let version = parts.next()?;
    let code = parts.next()?.trim().parse::<u16>().ok()?;
    let reason = parts.next().unwrap_or("").trim();
    Some(StatusLine {
        version: version.to_string(),
        code,
        reason: reason.to_string(),
    })
}

/// Status of the final (non-interim) status line in a header block.
pub fn final_status(headers: &[u8]) -> Option<u16> {
    headers
        .split(|&b| b == b'\n')
        .filter_map(|line| parse_status_line(line))
        .last()
        .map(|s| s.code)
}

/// Case-insensitive header lookup; the first line (request/status) is skipped.
pub fn header_value<'a>(headers: &'a [u8], name: &str) -> Option<&'a [u8]> {
    headers
        .split(|&b| b == b'\n')
        .skip(1)
        .filter_map(|line| {
            let colon = line.iter().position(|&b| b == b':')?;
            let (key, value) = line.split_at(colon);
            trim_ascii(key)
                .eq_ignore_ascii_case(name.as_bytes())
                .then(|| trim_ascii(&value[1..]))
        })
        .last()
}

pub fn header_str(headers: &[u8], name: &str) -> Option<String> {
    header_value(headers, name).map(|v| String::from_utf8_lossy(v).into_owned())
}

pub fn content_length(headers: &[u8]) -> Option<u64> {
    header_str(headers, "content-length")?.trim().parse().ok()
}

pub fn is_chunked(headers: &[u8]) -> bool {
    header_str(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// `charset` parameter of a content type, unquoted.
pub fn charset_of(content_type: &str) -> Option<&str> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let rest = &content_type[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    let charset = rest[..end].trim().trim_matches(|c| c == '"' || c == '\'');
    (!charset.is_empty()).then_some(charset)
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// `scheme://host[:port]path`; the port is dropped when it is the scheme
/// default.
pub fn build_url(scheme: &str, host: &str, port: Option<u16>, path: &str) -> String {
    let scheme = scheme.to_ascii_lowercase();
    let mut url = format!("{scheme}://{host}");
    if let Some(port) = port {
        if default_port(&scheme) != Some(port) {
            url.push_str(&format!(":{port}"));
        }
    }
    if !path.is_empty() && !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    url
}

struct UrlParts<'a> {
    scheme: &'a str,
    host: &'a str,
    port: Option<u16>,
    rest: &'a str,
}

fn split_url(url: &str) -> Option<UrlParts<'_>> {
    let (scheme, after) = url.split_once("://")?;
    let authority_end = after.find(['/', '?', '#']).unwrap_or(after.len());
    let (authority, rest) = after.split_at(authority_end);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = match authority.rfind(':') {
        Some(idx) if !authority[idx + 1..].is_empty() && authority[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            (&authority[..idx], authority[idx + 1..].parse().ok())
        }
        _ => (authority, None),
    };
    Some(UrlParts { scheme, host, port, rest })
}

/// Absolute URL with a redundant default port removed.
pub fn normalize_url(url: &str) -> String {
    match split_url(url) {
        Some(parts) => build_url(parts.scheme, parts.host, parts.port, parts.rest),
        None => url.to_string(),
    }
}

pub fn host_of_url(url: &str) -> Option<&str> {
    split_url(url).map(|p| p.host).filter(|h| !h.is_empty())
}

pub fn is_absolute(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Host header value without its port.
pub fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].bytes().all(|b| b.is_ascii_digit()) && !host.ends_with(']') => &host[..idx],
        _ => host,
    }
}
