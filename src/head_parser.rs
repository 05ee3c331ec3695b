//! Pure functions over byte strings: request head parsing and form-body
//! decoding. Neither function touches a socket or buffers partial input —
//! the `Stream` layer only calls these once a complete delimiter- or
//! length-delimited chunk has already been assembled.

use std::collections::HashMap;

use crate::args::{self, Arguments};
use crate::error::{Result, ServerError};
use crate::headers::{HeaderSet, RequestHead};

/// One form field: a single value, a repeated value (same key seen more
/// than once), or an uploaded file (multipart only).
#[derive(Debug, Clone)]
pub enum FormPart {
    Value(String),
    Multi(Vec<String>),
    File(FileField),
}

#[derive(Debug, Clone)]
pub struct FileField {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Parses a request line and header block. `bytes` must end with
/// `\r\n\r\n` (the terminating blank line); the `Stream`'s `read_until`
/// guarantees this by construction.
pub fn parse_request_head(bytes: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(bytes).map_err(|_| ServerError::MalformedHead)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ServerError::MalformedHead)?;
    let (method, rest) = request_line
        .split_once(' ')
        .ok_or(ServerError::MalformedHead)?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-') {
        return Err(ServerError::MalformedHead);
    }
    let (uri, version) = rest
        .trim_start()
        .rsplit_once(' ')
        .ok_or(ServerError::MalformedHead)?;
    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        return Err(ServerError::MalformedHead);
    }
    if uri.is_empty() {
        return Err(ServerError::MalformedHead);
    }

    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p, q),
        None => (uri, ""),
    };

    let mut headers = HeaderSet::new();
    for line in lines {
        if line.is_empty() {
            // Blank line: end of header block. Anything after it (there
            // shouldn't be anything, since the caller trims at the
            // delimiter) is ignored.
            break;
        }
        // Permissive: lines that don't contain ':' are skipped rather than
        // failing the whole request.
        if let Some((name, value)) = line.split_once(':') {
            let value = value.strip_prefix(' ').unwrap_or(value);
            headers.insert(name.trim(), value);
        }
    }

    let query_args = args::parse_www_form(query).unwrap_or_else(|_| Arguments::new());

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        version: version.to_string(),
        headers,
        query_args,
    })
}

/// Decodes a form body according to `content_type`. Unknown content types
/// produce an empty map rather than an error — the body is simply not
/// interpreted as form data.
pub fn parse_form_body(content_type: &str, bytes: &[u8]) -> Result<HashMap<String, FormPart>> {
    let ct = content_type.trim();
    if ct.starts_with("application/x-www-form-urlencoded") {
        let body = std::str::from_utf8(bytes).map_err(|_| ServerError::MalformedBody)?;
        let parsed = args::parse_www_form(body)?;
        let mut out = HashMap::new();
        for (k, v) in parsed.iter() {
            let part = match v {
                args::ArgValue::Single(s) => FormPart::Value(s.clone()),
                args::ArgValue::Multi(values) => FormPart::Multi(values.clone()),
            };
            out.insert(k.clone(), part);
        }
        Ok(out)
    } else if ct.starts_with("multipart/form-data") {
        let boundary = ct
            .split(';')
            .skip(1)
            .find_map(|p| p.trim().strip_prefix("boundary="))
            .map(|b| b.trim_matches('"'))
            .ok_or(ServerError::MalformedBody)?;
        parse_multipart(boundary, bytes)
    } else {
        Ok(HashMap::new())
    }
}

fn parse_multipart(boundary: &str, bytes: &[u8]) -> Result<HashMap<String, FormPart>> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut out = HashMap::new();

    let mut pos = find_subsequence(bytes, &delimiter, 0).ok_or(ServerError::MalformedBody)?;
    pos += delimiter.len();

    loop {
        // Skip the CRLF after the boundary marker, or detect the closing
        // `--` that ends the whole body.
        if bytes.get(pos..pos + 2) == Some(b"--") {
            break;
        }
        pos += 2; // \r\n after the boundary line

        let headers_end = find_subsequence(bytes, b"\r\n\r\n", pos).ok_or(ServerError::MalformedBody)?;
        let headers_str =
            std::str::from_utf8(&bytes[pos..headers_end]).map_err(|_| ServerError::MalformedBody)?;
        let part_info = parse_part_headers(headers_str);
        let body_start = headers_end + 4;

        let next_boundary = find_subsequence(bytes, &delimiter, body_start)
            .ok_or(ServerError::MalformedBody)?;
        // The part body ends two bytes before the boundary (trailing \r\n).
        let body_end = next_boundary.saturating_sub(2).max(body_start);
        let part_bytes = bytes[body_start..body_end].to_vec();

        // §3's 256-entry cap applies per source; a multipart body is one
        // source, so a part naming a brand new field once the cap is
        // already hit is dropped rather than growing the map further.
        if out.contains_key(&part_info.name) || out.len() < args::MAX_ARGS {
            if let Some(filename) = part_info.filename {
                out.insert(
                    part_info.name,
                    FormPart::File(FileField {
                        filename,
                        content_type: part_info.content_type,
                        bytes: part_bytes,
                    }),
                );
            } else {
                let value = String::from_utf8_lossy(&part_bytes).into_owned();
                out.insert(part_info.name, FormPart::Value(value));
            }
        }

        pos = next_boundary + delimiter.len();
    }

    Ok(out)
}

struct PartInfo {
    name: String,
    filename: Option<String>,
    content_type: String,
}

fn parse_part_headers(headers: &str) -> PartInfo {
    let mut info = PartInfo {
        name: String::new(),
        filename: None,
        content_type: "text/plain".to_string(),
    };
    for line in headers.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Content-Disposition:") {
            for field in rest.split(';') {
                let field = field.trim();
                if let Some(v) = field.strip_prefix("name=") {
                    info.name = v.trim_matches('"').to_string();
                } else if let Some(v) = field.strip_prefix("filename=") {
                    info.filename = Some(v.trim_matches('"').to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("Content-Type:") {
            info.content_type = rest.trim().to_string();
        }
    }
    info
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let head = parse_request_head(b"GET /a?x=1 HTTP/1.1\r\nHost: example\r\n\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/a");
        assert_eq!(head.query, "x=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.headers.get("host"), Some("example"));
        assert_eq!(head.query_args.get_first("x"), Some("1"));
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(matches!(
            parse_request_head(b"GET / HTTP/2.0\r\n\r\n"),
            Err(ServerError::MalformedHead)
        ));
    }

    #[test]
    fn rejects_garbage_request_line() {
        assert!(matches!(
            parse_request_head(b"GARBAGE\r\n\r\n"),
            Err(ServerError::MalformedHead)
        ));
    }

    #[test]
    fn skips_header_lines_without_colon() {
        let head =
            parse_request_head(b"GET / HTTP/1.1\r\nnonsense line\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers.get("host"), Some("x"));
    }

    #[test]
    fn urlencoded_form_body() {
        let parsed = parse_form_body(
            "application/x-www-form-urlencoded",
            b"a=1&b=2&a=3",
        )
        .unwrap();
        match &parsed["a"] {
            FormPart::Multi(v) => assert_eq!(v, &vec!["1".to_string(), "3".to_string()]),
            _ => panic!("expected multi value"),
        }
        match &parsed["b"] {
            FormPart::Value(v) => assert_eq!(v, "2"),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn multipart_with_file_and_value() {
        let body = concat!(
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"field1\"\r\n\r\n",
            "value1\r\n",
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"file1\"; filename=\"a.txt\"\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "file-bytes\r\n",
            "--XYZ--\r\n"
        );
        let parsed = parse_form_body("multipart/form-data; boundary=XYZ", body.as_bytes()).unwrap();
        match &parsed["field1"] {
            FormPart::Value(v) => assert_eq!(v, "value1"),
            _ => panic!("expected value"),
        }
        match &parsed["file1"] {
            FormPart::File(f) => {
                assert_eq!(f.filename, "a.txt");
                assert_eq!(f.content_type, "text/plain");
                assert_eq!(f.bytes, b"file-bytes");
            }
            _ => panic!("expected file"),
        }
    }

    #[test]
    fn multipart_missing_boundary_is_malformed() {
        assert!(matches!(
            parse_form_body("multipart/form-data", b"anything"),
            Err(ServerError::MalformedBody)
        ));
    }

    #[test]
    fn unknown_content_type_yields_empty_map() {
        let parsed = parse_form_body("application/octet-stream", b"binary").unwrap();
        assert!(parsed.is_empty());
    }
}
