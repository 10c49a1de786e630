//! Parsing and printing of the HTTP messages carried inside multipart
//! parts: a request line or status line, a header block, and a verbatim
//! body after the first blank line.

use bytes::Bytes;
use hyper::Uri;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed HTTP request in part payload")]
    BadRequest,

    #[error("Malformed HTTP response in part payload")]
    BadResponse,
}

/// One HTTP request pulled out of a batch part.
///
/// The request line is expected in absolute form (`GET http://host/path
/// HTTP/1.1`), the convention for requests that go through a proxy. A
/// request-URI without an authority falls back to the `Host` header.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub request_uri: String,
    pub version: String,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<usize>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Request {
    pub fn parse(payload: &[u8]) -> Result<Request, ParseError> {
        let mut lines = Lines::new(payload);

        let request_line = lines.next().ok_or(ParseError::BadRequest)?;
        let request_line = std::str::from_utf8(request_line).map_err(|_| ParseError::BadRequest)?;
        let mut tokens = request_line.split_whitespace();
        let method = tokens.next().ok_or(ParseError::BadRequest)?.to_string();
        let request_uri = tokens.next().ok_or(ParseError::BadRequest)?.to_string();
        let version = tokens.next().ok_or(ParseError::BadRequest)?.to_string();

        let uri: Uri = request_uri.parse().map_err(|_| ParseError::BadRequest)?;
        let scheme = uri.scheme_str().map(str::to_string);
        let mut host = uri.authority().map(|a| a.to_string());
        let path = uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        // Some legacy clients send one extra blank line after a POST
        // request line; tolerate it, but only once.
        if method == "POST" {
            lines.skip_one_blank();
        }

        let mut request = Request {
            method,
            request_uri,
            version,
            scheme,
            host: None,
            path,
            headers: Vec::new(),
            content_length: None,
            content_type: None,
            body: Bytes::new(),
        };

        let body = parse_header_block(&mut lines, || ParseError::BadRequest, |name, value| {
            match name {
                "content-length" => {
                    request.content_length =
                        Some(value.parse().map_err(|_| ParseError::BadRequest)?)
                }
                "content-type" => request.content_type = Some(value.to_string()),
                "host" if host.is_none() => host = Some(value.to_string()),
                _ => {}
            }
            request.headers.push((name.to_string(), value.to_string()));
            Ok(())
        })?;

        request.host = host;
        request.body = Bytes::copy_from_slice(body);
        Ok(request)
    }

    /// First value of the named header, if present. Lookup is by the
    /// lowercased name the parser stored.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    /// Replace the named header, or append it if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value)
    }

    pub fn remove_header(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
    }

    /// Print the request in origin form (relative path), the shape an
    /// origin server expects on a direct connection.
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(format!("{} {} {}\r\n", self.method, self.path, self.version).as_bytes());
        for (name, value) in &self.headers {
            out.extend(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend(b"\r\n");
        out.extend(&self.body);
        out
    }
}

/// One HTTP response pulled out of a batch part, header section only;
/// the body travels separately so cache post-processing can swap it out.
///
/// A degenerate status line without a version (`200 OK`) or without a
/// reason phrase is accepted.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<usize>,
    pub content_type: Option<String>,
}

impl Response {
    pub fn parse(payload: &[u8]) -> Result<(Response, Bytes), ParseError> {
        let mut lines = Lines::new(payload);

        let status_line = lines.next().ok_or(ParseError::BadResponse)?;
        let status_line = std::str::from_utf8(status_line).map_err(|_| ParseError::BadResponse)?;
        let mut tokens = status_line.split_whitespace();

        let first = tokens.next().ok_or(ParseError::BadResponse)?;
        let (version, code) = if first.starts_with("HTTP/") {
            (first.to_string(), tokens.next().ok_or(ParseError::BadResponse)?)
        } else {
            (String::new(), first)
        };
        let status: u16 = code.parse().map_err(|_| ParseError::BadResponse)?;
        // Sometimes there is no reason phrase.
        let reason = tokens.collect::<Vec<_>>().join(" ");

        let mut response = Response {
            version,
            status,
            reason,
            headers: Vec::new(),
            content_length: None,
            content_type: None,
        };

        let body = parse_header_block(&mut lines, || ParseError::BadResponse, |name, value| {
            match name {
                "content-length" => {
                    response.content_length =
                        Some(value.parse().map_err(|_| ParseError::BadResponse)?)
                }
                "content-type" => response.content_type = Some(value.to_string()),
                _ => {}
            }
            response.headers.push((name.to_string(), value.to_string()));
            Ok(())
        })?;

        Ok((response, Bytes::copy_from_slice(body)))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value)
    }

    pub fn remove_header(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
    }

    /// Print the response with the given body appended after the header
    /// block. Used for the records handed to the agent's cache.
    pub fn write(&self, body: &[u8]) -> Vec<u8> {
        let version = if self.version.is_empty() {
            "HTTP/1.1"
        } else {
            &self.version
        };
        let mut out = Vec::new();
        if self.reason.is_empty() {
            out.extend(format!("{} {}\r\n", version, self.status).as_bytes());
        } else {
            out.extend(format!("{} {} {}\r\n", version, self.status, self.reason).as_bytes());
        }
        for (name, value) in &self.headers {
            out.extend(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend(b"\r\n");
        out.extend(body);
        out
    }
}

/// Feed header lines to `each` (folding continuations, lowercasing
/// names, right-trimming values) until the blank separator line, then
/// return the remainder of the payload verbatim.
fn parse_header_block<'a, E, F>(
    lines: &mut Lines<'a>,
    error: E,
    mut each: F,
) -> Result<&'a [u8], ParseError>
where
    E: Fn() -> ParseError,
    F: FnMut(&str, &str) -> Result<(), ParseError>,
{
    let mut pending: Option<String> = None;

    loop {
        let line = match lines.next() {
            Some(line) => line,
            None => break,
        };
        if line.is_empty() {
            break;
        }
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => return Err(error()),
        };

        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous header.
            match pending.as_mut() {
                Some(header) => {
                    header.push('\n');
                    header.push_str(line);
                }
                None => return Err(error()),
            }
            continue;
        }

        if let Some(header) = pending.take() {
            let (name, value) = split_header(&header).ok_or_else(&error)?;
            each(&name, value)?;
        }
        pending = Some(line.to_string());
    }

    if let Some(header) = pending.take() {
        let (name, value) = split_header(&header).ok_or_else(&error)?;
        each(&name, value)?;
    }

    Ok(lines.rest())
}

fn split_header(line: &str) -> Option<(String, &str)> {
    let colon = line.find(':')?;
    let name = line[..colon].trim().to_ascii_lowercase();
    let value = line[colon + 1..].trim();
    Some((name, value))
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    let name = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.as_str())
}

pub(crate) fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    let name = name.to_ascii_lowercase();
    for (n, v) in headers.iter_mut() {
        if *n == name {
            *v = value.to_string();
            return;
        }
    }
    headers.push((name, value.to_string()));
}

/// Iterator over the lines of a header section. Lines end at `\n`, with
/// an optional `\r` trimmed, so both canonical CRLF messages and the
/// LF-only ones some processors emit are parsed alike. The body keeps
/// its bytes untouched.
struct Lines<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Lines<'a> {
    fn new(payload: &'a [u8]) -> Lines<'a> {
        Lines { payload, offset: 0 }
    }

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let rest = &self.payload[self.offset..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                self.offset += nl + 1;
                let mut line = &rest[..nl];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                Some(line)
            }
            None => {
                self.offset = self.payload.len();
                Some(rest)
            }
        }
    }

    /// Consume the next line only if it is blank.
    fn skip_one_blank(&mut self) {
        let saved = self.offset;
        match self.next() {
            Some(line) if line.is_empty() => {}
            _ => self.offset = saved,
        }
    }

    fn rest(&self) -> &'a [u8] {
        &self.payload[self.offset.min(self.payload.len())..]
    }
}
