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
use rand::Rng;

mod address;
mod headers;
mod mime;

pub use address::Address;
pub use headers::Headers;
pub use mime::{ContentType, Part};

const GENERATED_ID_LENGTH: usize = 64;

/// A message delivered through a completed DATA command: the parsed RFC 5322
/// envelope, the raw body, and the forward-paths negotiated on the session.
///
/// The body is kept as received; the MIME tree is only computed when
/// [`Message::parts`] (or one of the body accessors) is called, so a message
/// with a broken body still hands its envelope to the application.
#[derive(Debug, Clone)]
pub struct Message {
    /// first mailbox of the From header
    pub from: Address,
    /// To header mailboxes; advisory, see [`Message::rcpt`]
    pub to: Vec<Address>,
    /// the full header block, case-preserving
    pub headers: Headers,
    /// Subject header, empty when absent
    pub subject: String,
    /// body bytes as received, after dot-unstuffing
    pub raw_body: Vec<u8>,

    rcpt: Vec<Address>,
    generated_id: once_cell::sync::OnceCell<String>,
}

impl Message {
    /// Parse a DATA payload into a message.
    ///
    /// `rcpt` is the authoritative recipient list taken from the RCPT
    /// commands of the session; it may differ from the To header.
    ///
    /// # Errors
    ///
    /// * the header block is malformed, or the To / From headers are
    ///   missing or unparseable
    pub fn new(data: &[u8], rcpt: Vec<Address>) -> anyhow::Result<Self> {
        let (headers, body_offset) = Headers::parse_block(data)?;

        let to = Address::parse_list(headers.get("To").context("message has no To header")?)?;
        let from =
            Address::parse_list(headers.get("From").context("message has no From header")?)?
                .into_iter()
                .next()
                .context("message has an empty From header")?;
        let subject = headers.get("Subject").unwrap_or_default().to_string();

        Ok(Self {
            from,
            to,
            subject,
            raw_body: data[body_offset..].to_vec(),
            headers,
            rcpt,
            generated_id: once_cell::sync::OnceCell::new(),
        })
    }

    /// The envelope recipients (RCPT TO) this message was accepted for.
    #[must_use]
    pub fn rcpt(&self) -> &[Address] {
        &self.rcpt
    }

    /// Stable identifier: the Message-ID header when present, otherwise a
    /// random token generated once and memoised.
    pub fn id(&self) -> &str {
        if let Some(id) = self.headers.get("Message-ID") {
            return id;
        }
        self.generated_id.get_or_init(|| {
            rand::thread_rng()
                .sample_iter(rand::distributions::Alphanumeric)
                .take(GENERATED_ID_LENGTH)
                .map(char::from)
                .collect()
        })
    }

    /// Envelope-only recipients: every RCPT address that does not appear in
    /// the To header.
    #[must_use]
    pub fn bcc(&self) -> Vec<Address> {
        let visible = self
            .to
            .iter()
            .map(|to| to.address.as_str())
            .collect::<std::collections::HashSet<_>>();

        self.rcpt
            .iter()
            .filter(|recipient| !visible.contains(recipient.address.as_str()))
            .cloned()
            .collect()
    }

    /// Decode the raw body into its MIME parts. Parsed on demand; errors
    /// surface here rather than at construction.
    ///
    /// # Errors
    ///
    /// * see [`Part`] parsing: malformed media types, boundaries, or
    ///   transfer encodings
    pub fn parts(&self) -> anyhow::Result<Vec<Part>> {
        mime::parse_content(&self.headers, &self.raw_body)
    }

    /// The `text/plain` content of the message, if any.
    ///
    /// # Errors
    ///
    /// * no plain-text content exists, or the body cannot be parsed
    pub fn plain(&self) -> anyhow::Result<Vec<u8>> {
        self.find_body("text/plain")
    }

    /// The `text/html` content of the message, if any.
    ///
    /// # Errors
    ///
    /// * no HTML content exists, or the body cannot be parsed
    pub fn html(&self) -> anyhow::Result<Vec<u8>> {
        self.find_body("text/html")
    }

    /// Find the body of the first part carrying the given media type.
    ///
    /// The search covers the top-level part and, for multipart messages,
    /// the direct children of the `multipart/alternative` section (either
    /// top-level or nested one level below, as in `multipart/mixed`).
    ///
    /// # Errors
    ///
    /// * no part with the requested type exists, or the body cannot be
    ///   parsed
    pub fn find_body(&self, content_type: &str) -> anyhow::Result<Vec<u8>> {
        let media_type =
            ContentType::parse(self.headers.get("Content-Type").unwrap_or_default())?.media_type;
        let parts = self.parts()?;

        let alternatives: Vec<&Part> = if media_type == content_type {
            return parts.first().map(|part| part.body.clone()).ok_or_else(|| {
                anyhow::anyhow!("{content_type} found, but no data in body")
            });
        } else if media_type == "multipart/alternative" {
            parts.iter().collect()
        } else {
            find_type_in_parts("multipart/alternative", &parts)
                .map(|alternative| alternative.children.iter().collect())
                .unwrap_or_default()
        };

        if alternatives.is_empty() {
            anyhow::bail!("No multipart/alternative section found, can't find {content_type}");
        }

        alternatives
            .iter()
            .find(|part| {
                part.content_type()
                    .map(|ct| ct.media_type == content_type)
                    .unwrap_or(false)
            })
            .map(|part| part.body.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("No {content_type} content found in multipart/alternative section")
            })
    }

    /// The attachments of a `multipart/mixed` message: its direct
    /// non-multipart children. Any other top-level media type has none.
    ///
    /// # Errors
    ///
    /// * the top-level or a child `Content-Type` is malformed, or the body
    ///   cannot be parsed
    pub fn attachments(&self) -> anyhow::Result<Vec<Part>> {
        let media_type =
            ContentType::parse(self.headers.get("Content-Type").unwrap_or_default())?.media_type;
        if media_type != "multipart/mixed" {
            return Ok(vec![]);
        }

        let mut attachments = vec![];
        for part in self.parts()? {
            if !part.content_type()?.is_multipart() {
                attachments.push(part);
            }
        }
        Ok(attachments)
    }
}

fn find_type_in_parts<'a>(content_type: &str, parts: &'a [Part]) -> Option<&'a Part> {
    parts.iter().find(|part| {
        part.content_type()
            .map(|ct| ct.media_type == content_type)
            .unwrap_or(false)
    })
}
