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

use super::{AuthMechanism, Principal};
use crate::connection::Connection;
use crate::error::SmtpError;

/// Credential check: maps `(authcid, password)` to a principal, or `None`
/// when the pair is invalid.
pub type PlainAuthFn =
    dyn Fn(&str, &str) -> Option<std::sync::Arc<dyn Principal>> + Send + Sync;

/// AUTH PLAIN (RFC 4616). Refuses to run without TLS.
pub struct AuthPlain {
    check: Box<PlainAuthFn>,
}

impl AuthPlain {
    pub fn new(
        check: impl Fn(&str, &str) -> Option<std::sync::Arc<dyn Principal>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            check: Box::new(check),
        }
    }

    /// Split a base64 `authzid NUL authcid NUL passwd` blob into the
    /// credential pair.
    fn unpack(line: &str) -> anyhow::Result<(String, String)> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(line.trim())
            .context("malformed base64 in AUTH PLAIN response")?;
        let raw = String::from_utf8(raw).context("AUTH PLAIN response is not UTF-8")?;

        let fields = raw.split('\0').collect::<Vec<_>>();
        if fields.len() != 3 {
            anyhow::bail!("malformed auth string");
        }
        Ok((fields[1].to_string(), fields[2].to_string()))
    }
}

#[async_trait::async_trait]
impl AuthMechanism for AuthPlain {
    async fn authenticate(
        &self,
        conn: &mut Connection,
        initial: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn Principal>> {
        if !conn.is_tls {
            return Err(SmtpError::requires_tls().into());
        }

        let response = if initial.trim().is_empty() {
            conn.write_reply(334, "").await?;
            conn.read_line().await?
        } else {
            initial.to_string()
        };

        let (username, password) = Self::unpack(&response)?;
        match (self.check)(&username, &password) {
            Some(user) => Ok(user),
            None => Err(SmtpError::auth_failed().into()),
        }
    }
}
