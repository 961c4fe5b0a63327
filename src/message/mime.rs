/*
 * smtpd - embeddable SMTP server
 * Copyright (C) 2022 the smtpd developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 *  This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use anyhow::Context;
use base64::Engine;

use super::headers::Headers;

/// A parsed `Content-Type` header: lower-cased media type plus its
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// `type/subtype`, lower-cased
    pub media_type: String,
    /// parameters with lower-cased keys, quoting stripped
    pub params: std::collections::HashMap<String, String>,
}

impl ContentType {
    /// Parse a `Content-Type` value such as
    /// `multipart/mixed; boundary="sep"`.
    ///
    /// # Errors
    ///
    /// * the value is blank ("no media type"), has no `/`, or a parameter
    ///   has no `=`
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let mut segments = value.split(';');
        let media_type = segments
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if media_type.is_empty() {
            anyhow::bail!("no media type");
        }
        let (main, sub) = media_type
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("'{media_type}' has no type/subtype form"))?;
        if main.is_empty() || sub.is_empty() {
            anyhow::bail!("'{media_type}' has no type/subtype form");
        }

        let mut params = std::collections::HashMap::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("malformed media type parameter '{segment}'"))?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        }

        Ok(Self { media_type, params })
    }

    fn octet_stream() -> Self {
        Self {
            media_type: "application/octet-stream".to_string(),
            params: std::collections::HashMap::new(),
        }
    }

    #[must_use]
    pub fn boundary(&self) -> Option<&str> {
        self.params.get("boundary").map(String::as_str)
    }

    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.media_type.starts_with("multipart/")
    }
}

/// One node of the decoded MIME tree. Leaves carry transfer-decoded bytes;
/// multipart nodes carry the raw bytes of their region and expose the
/// decoded content through `children`.
#[derive(Debug, Clone, Default)]
pub struct Part {
    pub headers: Headers,
    pub body: Vec<u8>,
    pub children: Vec<Part>,
}

impl Part {
    /// Parsed `Content-Type` of this part.
    ///
    /// # Errors
    ///
    /// * the header is absent or malformed
    pub fn content_type(&self) -> anyhow::Result<ContentType> {
        ContentType::parse(self.headers.get("Content-Type").unwrap_or_default())
    }
}

/// Decode the body of a leaf according to its `Content-Transfer-Encoding`.
/// `7bit`, `8bit`, `binary` and an absent header pass through unchanged.
///
/// # Errors
///
/// * the quoted-printable or base64 payload is malformed
pub(crate) fn decode_transfer_encoding(
    encoding: Option<&str>,
    raw: &[u8],
) -> anyhow::Result<Vec<u8>> {
    match encoding.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("quoted-printable") => decode_quoted_printable(raw),
        Some("base64") => decode_base64(raw),
        _ => Ok(raw.to_vec()),
    }
}

/// RFC 2045 §6.7 decoder: `=XX` escapes with strict hex validation, soft
/// line breaks removed, every other byte passed through.
pub(crate) fn decode_quoted_printable(raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'=' {
            decoded.push(raw[i]);
            i += 1;
            continue;
        }
        // soft line break: "=\r\n" or "=\n"
        if raw.get(i + 1) == Some(&b'\r') && raw.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if raw.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        let hex = raw
            .get(i + 1..i + 3)
            .ok_or_else(|| anyhow::anyhow!("incomplete quoted-printable escape at offset {i}"))?;
        let hex = std::str::from_utf8(hex)
            .map_err(|_| anyhow::anyhow!("invalid quoted-printable escape at offset {i}"))?;
        let byte = u8::from_str_radix(hex, 16)
            .map_err(|_| anyhow::anyhow!("invalid quoted-printable escape '={hex}'"))?;
        decoded.push(byte);
        i += 3;
    }
    Ok(decoded)
}

/// Strict base64 decoding, except that line breaks and surrounding
/// whitespace are ignored the way mail transports fold encoded bodies.
pub(crate) fn decode_base64(raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let filtered = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect::<Vec<_>>();
    base64::engine::general_purpose::STANDARD
        .decode(filtered)
        .context("invalid base64 body")
}

/// Split a multipart body into its raw sections, preserving the exact bytes
/// between the boundary markers. Fails when the closing `--boundary--`
/// sentinel never arrives.
pub(crate) fn split_multipart<'a>(
    body: &'a [u8],
    boundary: &str,
) -> anyhow::Result<Vec<&'a [u8]>> {
    let delimiter = format!("--{boundary}");
    let terminator = format!("--{boundary}--");

    let mut sections = vec![];
    let mut section_start = None;
    let mut pos = 0;
    let mut terminated = false;

    while pos < body.len() {
        let line_end = body[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |i| pos + i);
        let mut content_end = line_end;
        if content_end > pos && body[content_end - 1] == b'\r' {
            content_end -= 1;
        }
        let line = trim_ascii_end(&body[pos..content_end]);

        if line == terminator.as_bytes() {
            if let Some(start) = section_start.take() {
                sections.push(&body[start..section_end(body, start, pos)]);
            }
            terminated = true;
            break;
        }
        if line == delimiter.as_bytes() {
            if let Some(start) = section_start.take() {
                sections.push(&body[start..section_end(body, start, pos)]);
            }
            section_start = Some(if line_end < body.len() { line_end + 1 } else { body.len() });
        }

        if line_end == body.len() {
            break;
        }
        pos = line_end + 1;
    }

    if !terminated {
        anyhow::bail!("multipart body is missing its '{terminator}' sentinel");
    }
    Ok(sections)
}

/// End of the section that runs up to the boundary line starting at
/// `marker_start`: the line break belonging to the boundary is not part of
/// the section.
fn section_end(body: &[u8], section_start: usize, marker_start: usize) -> usize {
    let mut end = marker_start;
    if end > section_start && body[end - 1] == b'\n' {
        end -= 1;
        if end > section_start && body[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}

fn trim_ascii_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && line[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &line[..end]
}

/// Recursively decode a body into its MIME parts.
///
/// A missing or blank `Content-Type` means `application/octet-stream`; any
/// other parse failure is fatal. Multipart bodies recurse through their
/// sub-parts, leaves get their transfer encoding resolved.
///
/// # Errors
///
/// * malformed media types, missing boundary, missing terminator, or a
///   transfer-decoding failure anywhere in the tree
pub(crate) fn parse_content(headers: &Headers, body: &[u8]) -> anyhow::Result<Vec<Part>> {
    let content_type = match headers.get("Content-Type").map(str::trim).filter(|v| !v.is_empty())
    {
        Some(value) => ContentType::parse(value).context("media type error")?,
        None => ContentType::octet_stream(),
    };

    if !content_type.is_multipart() {
        return Ok(vec![Part {
            headers: headers.clone(),
            body: decode_transfer_encoding(headers.get("Content-Transfer-Encoding"), body)?,
            children: vec![],
        }]);
    }

    let boundary = content_type
        .boundary()
        .context("multipart content without a boundary parameter")?;

    let mut parts = vec![];
    for section in split_multipart(body, boundary)? {
        let (part_headers, body_offset) =
            Headers::parse_block(section).context("malformed part header block")?;
        let raw = &section[body_offset..];

        let mut part = Part {
            body: decode_transfer_encoding(part_headers.get("Content-Transfer-Encoding"), raw)?,
            headers: part_headers,
            children: vec![],
        };

        let part_type = part.content_type()?;
        if part_type.is_multipart() {
            part.children = parse_content(&part.headers, &part.body)?;
        }
        parts.push(part);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::{
        decode_base64, decode_quoted_printable, decode_transfer_encoding, split_multipart,
        ContentType,
    };

    #[test]
    fn content_type_with_quoted_boundary() {
        let ct = ContentType::parse("multipart/Mixed; \t boundary=\"_=sep=_\"").unwrap();
        assert_eq!(ct.media_type, "multipart/mixed");
        assert_eq!(ct.boundary(), Some("_=sep=_"));
        assert!(ct.is_multipart());
    }

    #[test]
    fn content_type_without_slash_is_rejected() {
        assert!(ContentType::parse("gibberish").is_err());
        assert!(ContentType::parse("").is_err());
        assert!(ContentType::parse("text/").is_err());
    }

    #[test]
    fn quoted_printable_escapes_and_soft_breaks() {
        assert_eq!(
            decode_quoted_printable(b"Sending bees =F0=9F=90=9D").unwrap(),
            "Sending bees \u{1F41D}".as_bytes()
        );
        assert_eq!(decode_quoted_printable(b"one =\r\nline").unwrap(), b"one line");
        assert_eq!(decode_quoted_printable(b"one =\nline").unwrap(), b"one line");
    }

    #[test]
    fn corrupt_quoted_printable_is_an_error() {
        assert!(decode_quoted_printable(b"broken =FG escape").is_err());
        assert!(decode_quoted_printable(b"truncated =F").is_err());
    }

    #[test]
    fn base64_ignores_line_folding() {
        assert_eq!(
            decode_base64(b"aGVs\r\nbG8g\r\nd29ybGQ=").unwrap(),
            b"hello world"
        );
        assert!(decode_base64(b"not*base64*at*all").is_err());
    }

    #[test]
    fn passthrough_encodings() {
        for encoding in [None, Some("7bit"), Some("8bit"), Some("binary")] {
            assert_eq!(
                decode_transfer_encoding(encoding, b"as-is").unwrap(),
                b"as-is"
            );
        }
    }

    #[test]
    fn multipart_sections_are_raw_bytes() {
        let body = b"preamble\r\n--sep\r\nA: 1\r\n\r\nfirst\r\n--sep\r\nB: 2\r\n\r\nsecond\r\n--sep--\r\nepilogue";
        let sections = split_multipart(body, "sep").unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0], b"A: 1\r\n\r\nfirst");
        assert_eq!(sections[1], b"B: 2\r\n\r\nsecond");
    }

    #[test]
    fn unterminated_multipart_is_an_error() {
        assert!(split_multipart(b"--sep\r\ncontent\r\n", "sep").is_err());
    }
}
