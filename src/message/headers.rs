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

/// An ordered, case-preserving list of header fields.
///
/// Lookup is case-insensitive; the original spelling of every name is kept
/// for iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// First value of the named header, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of the named header, in order of appearance.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse an RFC 5322 header block, unfolding continuation lines, up to
    /// the first blank line (or the end of the input).
    ///
    /// Returns the headers and the offset of the first body byte.
    ///
    /// # Errors
    ///
    /// * a header line is not valid UTF-8 or has no colon
    pub fn parse_block(input: &[u8]) -> anyhow::Result<(Self, usize)> {
        let mut headers = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            let line_end = input[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(input.len(), |i| pos + i);
            let mut content_end = line_end;
            if content_end > pos && input[content_end - 1] == b'\r' {
                content_end -= 1;
            }
            let next = if line_end < input.len() { line_end + 1 } else { input.len() };

            // blank line closes the header block
            if content_end == pos {
                return Ok((Self(headers), next));
            }

            let line = std::str::from_utf8(&input[pos..content_end])
                .map_err(|e| anyhow::anyhow!("header line is not valid UTF-8: {e}"))?;

            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim_start());
                    }
                    None => anyhow::bail!("continuation line before any header field"),
                }
            } else {
                let (name, value) = line
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("malformed header line '{line}'"))?;
                headers.push((name.trim_end().to_string(), value.trim_start().to_string()));
            }

            pos = next;
        }

        Ok((Self(headers), input.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::Headers;

    #[test]
    fn block_ends_at_blank_line() {
        let input = b"Subject: hi\r\nFrom: a@example.org\r\n\r\nbody text";
        let (headers, offset) = Headers::parse_block(input).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("subject"), Some("hi"));
        assert_eq!(&input[offset..], b"body text");
    }

    #[test]
    fn folded_header_is_unfolded() {
        let input = b"Content-Type: multipart/alternative;\n \t boundary=\"sep\"\n\n";
        let (headers, _) = Headers::parse_block(input).unwrap();
        assert_eq!(
            headers.get("Content-Type"),
            Some("multipart/alternative; boundary=\"sep\"")
        );
    }

    #[test]
    fn case_preserving_lookup() {
        let (headers, _) = Headers::parse_block(b"X-CuStOm: 1\n\n").unwrap();
        assert_eq!(headers.get("x-custom"), Some("1"));
        assert_eq!(headers.iter().next().unwrap().0, "X-CuStOm");
    }

    #[test]
    fn line_without_colon_is_rejected() {
        assert!(Headers::parse_block(b"not a header\n\n").is_err());
    }

    #[test]
    fn repeated_headers_are_kept_in_order() {
        let (headers, _) =
            Headers::parse_block(b"Received: one\nReceived: two\n\n").unwrap();
        assert_eq!(
            headers.get_all("Received").collect::<Vec<_>>(),
            vec!["one", "two"]
        );
    }
}
