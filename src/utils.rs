use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use httparse::{parse_headers, Status, EMPTY_HEADER};

use crate::{Error, Result};

pub(crate) const MAX_HEADERS: usize = 8 * 2;
pub(crate) const DASHES: [u8; 2] = [b'-', b'-']; // `--`
pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';

const NAME: &[u8] = b"name";
const FILE_NAME: &[u8] = b"filename";
const FORM_DATA: &[u8] = b"form-data";

pub(crate) fn parse_content_type(header: Option<&HeaderValue>) -> Option<mime::Mime> {
    header
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Extracts the boundary parameter of a `multipart/form-data` content type.
pub(crate) fn parse_boundary(content_type: &mime::Mime) -> Result<String> {
    if content_type.type_() != mime::MULTIPART || content_type.subtype() != mime::FORM_DATA {
        return Err(Error::MissingBoundary);
    }

    content_type
        .get_param(mime::BOUNDARY)
        .map(|b| b.as_str().to_string())
        .filter(|b| !b.is_empty())
        .ok_or(Error::MissingBoundary)
}

pub(crate) fn parse_part_headers(bytes: &[u8]) -> Result<HeaderMap> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    match parse_headers(bytes, &mut headers) {
        Ok(Status::Complete((_, hs))) => {
            let len = hs.len();
            let mut header_map = HeaderMap::with_capacity(len);
            for h in hs.iter().take(len) {
                header_map.append(
                    HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| Error::InvalidHeader)?,
                    HeaderValue::from_bytes(h.value).map_err(|_| Error::InvalidHeader)?,
                );
            }
            Ok(header_map)
        }
        Ok(Status::Partial) | Err(_) => Err(Error::InvalidHeader),
    }
}

/// Parses `form-data; name="field"; filename="a.txt"`.
///
/// Returns the field name and the filename, both decoded as UTF-8.
pub(crate) fn parse_content_disposition(hv: &[u8]) -> Result<(Option<String>, Option<String>)> {
    if hv.len() < FORM_DATA.len() || !hv[..FORM_DATA.len()].eq_ignore_ascii_case(FORM_DATA) {
        return Err(Error::InvalidContentDisposition);
    }

    let mut i = FORM_DATA.len();
    let mut j = i;
    let mut quoted = false;
    let mut key: Option<&[u8]> = None;
    let mut v = Vec::<(&[u8], &[u8])>::with_capacity(2);

    loop {
        if i == hv.len() {
            if let Some(k) = key.take() {
                v.push((k, unquote(&hv[j..i])));
            }
            break;
        }

        match hv[i] {
            b'"' => {
                quoted = !quoted;
                i += 1;
            }
            b';' if !quoted => {
                if let Some(k) = key.take() {
                    v.push((k, unquote(&hv[j..i])));
                }
                i += 1;
                j = i;
            }
            b' ' if !quoted => {
                i += 1;
                if key.is_none() {
                    j = i;
                }
            }
            b'=' if !quoted && key.is_none() => {
                key = Some(&hv[j..i]);
                i += 1;
                j = i;
            }
            _ => {
                i += 1;
            }
        }
    }

    let find = |name: &[u8]| {
        v.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, val)| String::from_utf8_lossy(val).to_string())
    };

    Ok((find(NAME), find(FILE_NAME)))
}

fn unquote(s: &[u8]) -> &[u8] {
    if s.len() > 1 && s[0] == b'"' && s[s.len() - 1] == b'"' {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Strips any client-side directory prefix, `C:\docs\a.txt` becomes `a.txt`.
pub(crate) fn base_name(filename: &str) -> &str {
    filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename)
}

/// The extension after the last `.`, if any.
pub(crate) fn extension(filename: &str) -> Option<String> {
    filename
        .rfind('.')
        .map(|n| &filename[n + 1..])
        .filter(|ext| !ext.is_empty())
        .map(str::to_string)
}

/// Builds a collision-resistant temp file name: `{millis}_{random}_{name}`.
pub(crate) fn temp_file_name(filename: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let safe: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    format!("{millis}_{:08x}_{safe}", rand::random::<u32>())
}

/// Length of the line terminator that ends right before `n`.
pub(crate) fn line_terminator_len(buf: &[u8], n: usize) -> usize {
    match n {
        0 => 0,
        1 => usize::from(buf[0] == LF),
        _ if buf[n - 2] == CR && buf[n - 1] == LF => 2,
        _ => usize::from(buf[n - 1] == LF),
    }
}

/// Finds the blank line ending a header block, `\r\n` or a bare `\n`.
///
/// Returns its offset and its length.
pub(crate) fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    let blank = |n: usize| match &buf[n..] {
        [LF, ..] => Some((n, 1)),
        [CR, LF, ..] => Some((n, 2)),
        _ => None,
    };

    blank(0).or_else(|| memchr::memchr_iter(LF, buf).find_map(|n| blank(n + 1)))
}

/// Finds a parameter in a query string, `a=1&upload_id=abc`.
pub(crate) fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}
