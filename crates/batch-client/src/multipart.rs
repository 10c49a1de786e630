//! The `multipart/parallel` wire format used by the batch processor.
//!
//! It handles enough of MIME to frame HTTP messages as parts of a batch
//! request or response. It is a non-goal to handle all the complexity of
//! the multipart specification.

use httparse::{parse_headers, EMPTY_HEADER};
use log::{debug, trace};
use mime::Mime;
use uuid::Uuid;

const CONTENT_TYPE_REQUEST: &str = "application/http-request";
const CONTENT_TYPE_RESPONSE: &str = "application/http-response";

// Payloads are preceded by a short preamble, as a courtesy to anyone
// reading the raw body. MIME parsers skip everything before the first
// boundary delimiter.
const PREAMBLE: &str = "HTTP MIME Message\n";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Can't parse part headers: {0}")]
    Httparse(#[from] httparse::Error),

    #[error("Can't parse the MIME type: {0}")]
    Mime(#[from] mime::FromStrError),

    #[error("Can't decode a base64 part payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Message is not a MIME multipart document")]
    NotMultipart,

    #[error("Partial part headers on a finite body, something went wrong")]
    PartialHeaders,

    #[error("A part header value isn't valid UTF-8")]
    BadHeaderValue,
}

/// Which kind of HTTP message a part carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Request,
    Response,
}

impl PartKind {
    fn content_type(self) -> &'static str {
        match self {
            PartKind::Request => CONTENT_TYPE_REQUEST,
            PartKind::Response => CONTENT_TYPE_RESPONSE,
        }
    }
}

/// A part waiting to be written into a [`MultipartMessage`]. The payload
/// is kept as the raw HTTP message bytes; the transfer encoding is
/// applied when the enclosing message is written out.
#[derive(Debug)]
pub struct Part {
    kind: PartKind,
    request_id: String,
    payload: Vec<u8>,
}

impl Part {
    pub fn request(payload: Vec<u8>, request_id: usize) -> Part {
        Part {
            kind: PartKind::Request,
            request_id: request_id.to_string(),
            payload,
        }
    }

    pub fn response(payload: Vec<u8>, request_id: String) -> Part {
        Part {
            kind: PartKind::Response,
            request_id,
            payload,
        }
    }
}

/// An ordered set of parts under one freshly chosen boundary.
///
/// The boundary is derived from a v4 UUID so a collision with part
/// payloads is only a theoretical concern.
#[derive(Debug)]
pub struct MultipartMessage {
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartMessage {
    pub fn new() -> MultipartMessage {
        let boundary = format!("================{}==", Uuid::new_v4().to_simple());
        debug!("multipart.boundary = {}", boundary);

        MultipartMessage {
            boundary,
            parts: Vec::new(),
        }
    }

    pub fn attach(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The value to send as the top-level `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/parallel; boundary=\"{}\"", self.boundary)
    }

    /// Serialize the message body. The top-level headers (`Content-Type`
    /// and `MIME-Version`) are left to the caller, which sends them as
    /// HTTP headers rather than document headers.
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(PREAMBLE.as_bytes());

        for part in &self.parts {
            let head = format!(
                "\n--{boundary}\n\
                 Content-Type: {content_type}\n\
                 MIME-Version: 1.0\n\
                 Multipart-Request-ID: {id}\n\
                 Content-Transfer-Encoding: quoted-printable\n\
                 \n",
                boundary = self.boundary,
                content_type = part.kind.content_type(),
                id = part.request_id,
            );
            out.extend(head.as_bytes());
            out.extend(qp_encode(&part.payload));
        }

        out.extend(format!("\n--{}--\n", self.boundary).as_bytes());
        out
    }
}

/// A leaf part pulled out of a received multipart document, with its
/// transfer encoding already undone.
#[derive(Debug)]
pub struct ParsedPart {
    pub content_type: Mime,
    pub request_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Parse a multipart document into its leaf parts, descending into
/// nested multiparts along the way.
///
/// `content_type` is the top-level `Content-Type` header value; the
/// boundary is taken from its `boundary` parameter. Anything that isn't
/// `multipart/*` with a boundary is rejected as [`ParseError::NotMultipart`].
pub fn parse(content_type: &str, body: &[u8]) -> Result<Vec<ParsedPart>, ParseError> {
    let mime: Mime = content_type.parse()?;
    if mime.type_() != mime::MULTIPART {
        return Err(ParseError::NotMultipart);
    }
    let boundary = mime
        .get_param(mime::BOUNDARY)
        .ok_or(ParseError::NotMultipart)?
        .to_string();

    let mut parts = Vec::new();
    walk(&boundary, body, &mut parts)?;
    Ok(parts)
}

fn walk(boundary: &str, body: &[u8], out: &mut Vec<ParsedPart>) -> Result<(), ParseError> {
    for raw in split_parts(body, boundary) {
        let mut headers = [EMPTY_HEADER; 16];
        let (header_end, content_type, request_id, transfer_encoding) =
            match parse_headers(raw, &mut headers)? {
                httparse::Status::Partial => return Err(ParseError::PartialHeaders),
                httparse::Status::Complete((end, headers)) => {
                    let mut content_type = None;
                    let mut request_id = None;
                    let mut transfer_encoding = None;
                    for h in headers.iter() {
                        let value = std::str::from_utf8(h.value)
                            .map_err(|_| ParseError::BadHeaderValue)?;
                        if h.name.eq_ignore_ascii_case("content-type") {
                            content_type = Some(value.to_string());
                        } else if h.name.eq_ignore_ascii_case("multipart-request-id") {
                            request_id = Some(value.to_string());
                        } else if h.name.eq_ignore_ascii_case("content-transfer-encoding") {
                            transfer_encoding = Some(value.to_ascii_lowercase());
                        }
                    }
                    (end, content_type, request_id, transfer_encoding)
                }
            };

        let payload = &raw[header_end..];

        let mime: Mime = match content_type {
            Some(ct) => ct.parse()?,
            // A part with no content type carries nothing we know how to
            // dispatch; skip it.
            None => continue,
        };

        if mime.type_() == mime::MULTIPART {
            // Descend into the nested document with its own boundary.
            match mime.get_param(mime::BOUNDARY) {
                Some(inner) => walk(inner.as_str(), payload, out)?,
                None => return Err(ParseError::NotMultipart),
            }
            continue;
        }

        if mime.type_() != mime::APPLICATION {
            trace!("skipping part of type {}", mime);
            continue;
        }

        let payload = match transfer_encoding.as_deref() {
            Some("quoted-printable") => qp_decode(payload),
            Some("base64") => b64_decode(payload)?,
            _ => payload.to_vec(),
        };

        out.push(ParsedPart {
            content_type: mime,
            request_id,
            payload,
        });
    }

    Ok(())
}

/// Slice a multipart body into its raw parts (headers and payload, the
/// surrounding boundary delimiters removed). Both LF and CRLF delimiter
/// lines are accepted.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut start = None;
    let mut position = 0;

    while position + delimiter.len() <= body.len() {
        let at_line_start = position == 0 || body[position - 1] == b'\n';
        if !(at_line_start && body[position..].starts_with(&delimiter)) {
            position += 1;
            continue;
        }

        // The newline preceding the delimiter belongs to the delimiter,
        // not the part payload.
        if let Some(s) = start {
            let mut end = position;
            if end > s && body[end - 1] == b'\n' {
                end -= 1;
            }
            if end > s && body[end - 1] == b'\r' {
                end -= 1;
            }
            parts.push(&body[s..end]);
        }

        let after = position + delimiter.len();
        if body[after..].starts_with(b"--") {
            // Closing delimiter, everything after is epilogue.
            break;
        }

        // Skip the rest of the delimiter line.
        let next = match body[after..].iter().position(|&b| b == b'\n') {
            Some(nl) => after + nl + 1,
            None => break,
        };
        start = Some(next);
        position = next;
    }

    parts
}

// There is no quoted-printable codec in our dependency tree and pulling
// a full MIME engine in for two short functions isn't worth it, so the
// encoding is done manually here.

const QP_LINE_MAX: usize = 75;

fn qp_byte_is_literal(b: u8) -> bool {
    (b'!'..=b'~').contains(&b) && b != b'='
}

fn push_qp_escape(out: &mut Vec<u8>, line_len: &mut usize, b: u8) {
    if *line_len + 3 > QP_LINE_MAX {
        out.extend(b"=\n");
        *line_len = 0;
    }
    out.extend(format!("={:02X}", b).as_bytes());
    *line_len += 3;
}

fn push_qp_literal(out: &mut Vec<u8>, line_len: &mut usize, b: u8) {
    if *line_len + 1 > QP_LINE_MAX {
        out.extend(b"=\n");
        *line_len = 0;
    }
    out.push(b);
    *line_len += 1;
}

/// Quoted-printable encode. Tabs and spaces stay literal except at the
/// end of a line, which keeps encoded HTTP headers readable.
pub(crate) fn qp_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut offset = 0;

    while offset <= input.len() {
        let line_end = input[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p);
        let line = match line_end {
            Some(end) => &input[offset..end],
            None => &input[offset..],
        };

        let mut line_len = 0;
        for (i, &b) in line.iter().enumerate() {
            let at_line_end = i == line.len() - 1;
            if b == b' ' || b == b'\t' {
                if at_line_end {
                    push_qp_escape(&mut out, &mut line_len, b);
                } else {
                    push_qp_literal(&mut out, &mut line_len, b);
                }
            } else if qp_byte_is_literal(b) {
                push_qp_literal(&mut out, &mut line_len, b);
            } else {
                push_qp_escape(&mut out, &mut line_len, b);
            }
        }

        match line_end {
            Some(end) => {
                out.push(b'\n');
                offset = end + 1;
            }
            None => break,
        }
    }

    out
}

/// Quoted-printable decode. Unrecognized escapes pass through verbatim
/// rather than failing the whole part.
pub(crate) fn qp_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        let b = input[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break?
        if input[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }
        if input[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }

        match qp_hex_pair(&input[i + 1..]) {
            Some(decoded) => {
                out.push(decoded);
                i += 3;
            }
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }

    out
}

fn qp_hex_pair(input: &[u8]) -> Option<u8> {
    if input.len() < 2 {
        return None;
    }
    let hi = (input[0] as char).to_digit(16)?;
    let lo = (input[1] as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

/// Base64 transfer decoding. MIME line wrapping is removed first, and a
/// single newline the encoding side may have tacked onto the payload is
/// stripped again.
fn b64_decode(input: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    let cleaned: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    let mut value = base64::decode(&cleaned)?;
    if !input.ends_with(b"\n") && value.ends_with(b"\n") {
        value.pop();
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qp_encode_basics() {
        assert_eq!(qp_encode(b"plain text"), b"plain text".to_vec());
        // '=' must always be escaped, tabs stay literal mid-line.
        assert_eq!(qp_encode(b"a=b\tc"), b"a=3Db\tc".to_vec());
        // CR is not printable, LF passes through as the line ending.
        assert_eq!(qp_encode(b"GET / HTTP/1.1\r\n"), b"GET / HTTP/1.1=0D\n".to_vec());
        // Trailing whitespace on a line has to be escaped.
        assert_eq!(qp_encode(b"tail \n"), b"tail=20\n".to_vec());
        assert_eq!(qp_encode(b"tab\t\n"), b"tab=09\n".to_vec());
    }

    #[test]
    fn test_qp_long_lines_are_wrapped() {
        let input = vec![b'x'; 200];
        let encoded = qp_encode(&input);
        for line in encoded.split(|&b| b == b'\n') {
            assert!(line.len() <= 76, "line too long: {}", line.len());
        }
        assert_eq!(qp_decode(&encoded), input);
    }

    #[test]
    fn test_qp_round_trip() {
        let input = b"GET http://example.com/moose HTTP/1.1\r\nhost: example.com\r\naccept-encoding: identity\r\n\r\n";
        assert_eq!(qp_decode(&qp_encode(input)), input.to_vec());
    }

    #[test]
    fn test_qp_decode_tolerates_bad_escape() {
        assert_eq!(qp_decode(b"50% =ZZ done"), b"50% =ZZ done".to_vec());
        assert_eq!(qp_decode(b"soft=\nbreak"), b"softbreak".to_vec());
        assert_eq!(qp_decode(b"soft=\r\nbreak"), b"softbreak".to_vec());
    }

    #[test]
    fn test_b64_decode_strips_transfer_newline() {
        // "moose\n" encoded, but the raw payload doesn't end in a newline
        // itself; the decoded value loses the trailing one.
        let encoded = base64::encode(b"moose\n");
        assert_eq!(b64_decode(encoded.as_bytes()).unwrap(), b"moose".to_vec());
        // With a newline on the encoded form, the payload is left alone.
        let encoded = format!("{}\n", base64::encode(b"moose\n"));
        assert_eq!(b64_decode(encoded.as_bytes()).unwrap(), b"moose\n".to_vec());
    }

    #[test]
    fn test_round_trip() {
        let first = b"GET http://example.com/moose HTTP/1.1\r\nhost: example.com\r\n\r\n".to_vec();
        let second = b"GET http://example.com/fred HTTP/1.1\r\nhost: example.com\r\n\r\nhello".to_vec();

        let mut msg = MultipartMessage::new();
        msg.attach(Part::request(first.clone(), 1));
        msg.attach(Part::request(second.clone(), 2));

        let parts = parse(&msg.content_type(), &msg.write()).expect("can parse");

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content_type.as_ref(), "application/http-request");
        assert_eq!(parts[0].request_id.as_deref(), Some("1"));
        assert_eq!(parts[0].payload, first);
        assert_eq!(parts[1].request_id.as_deref(), Some("2"));
        assert_eq!(parts[1].payload, second);
    }

    #[test]
    fn test_boundaries_are_fresh() {
        assert_ne!(
            MultipartMessage::new().content_type(),
            MultipartMessage::new().content_type()
        );
    }

    #[test]
    fn test_parse_identity_parts() {
        let content_type = r#"multipart/parallel; boundary="foomfoomfoom""#;
        let body = "wah-ho, wah-hay\n\
            \n\
            --foomfoomfoom\n\
            Content-Type: application/http-response\n\
            Multipart-Request-ID: 2\n\
            \n\
            200 OK\n\
            Content-Type: application/json\n\
            \n\
            {\"name\": \"drang\"}\n\
            --foomfoomfoom\n\
            Content-Type: application/http-response\n\
            Multipart-Request-ID: 1\n\
            \n\
            200 OK\n\
            Content-Type: application/json\n\
            \n\
            {\"name\": \"sturm\"}\n\
            --foomfoomfoom--";

        let parts = parse(content_type, body.as_bytes()).expect("can parse");

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].request_id.as_deref(), Some("2"));
        assert!(parts[0].payload.ends_with(b"{\"name\": \"drang\"}"));
        assert_eq!(parts[1].request_id.as_deref(), Some("1"));
        assert!(parts[1].payload.ends_with(b"{\"name\": \"sturm\"}"));
    }

    #[test]
    fn test_parse_descends_into_nested_multipart() {
        let content_type = r#"multipart/mixed; boundary="outer""#;
        let body = "\
            --outer\n\
            Content-Type: multipart/parallel; boundary=\"inner\"\n\
            \n\
            --inner\n\
            Content-Type: application/http-response\n\
            Multipart-Request-ID: 1\n\
            \n\
            200 OK\n\
            \n\
            ok\n\
            --inner--\n\
            --outer--";

        let parts = parse(content_type, body.as_bytes()).expect("can parse");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].request_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_parse_rejects_non_multipart() {
        match parse("application/json", b"{}") {
            Err(ParseError::NotMultipart) => (),
            res => panic!("expected NotMultipart, got {:?}", res),
        }
        // multipart without a boundary parameter is just as useless
        match parse("multipart/parallel", b"") {
            Err(ParseError::NotMultipart) => (),
            res => panic!("expected NotMultipart, got {:?}", res),
        }
    }

    #[test]
    fn test_parse_base64_part() {
        let content_type = r#"multipart/parallel; boundary="b""#;
        let payload = base64::encode(b"HTTP/1.1 200 OK\r\n\r\nhi");
        let body = format!(
            "--b\n\
             Content-Type: application/http-response\n\
             Multipart-Request-ID: 1\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             {}\n\
             --b--",
            payload
        );

        let parts = parse(content_type, body.as_bytes()).expect("can parse");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].payload, b"HTTP/1.1 200 OK\r\n\r\nhi".to_vec());
    }
}
