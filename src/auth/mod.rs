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
use crate::connection::Connection;
use crate::error::SmtpError;
use crate::log_channel::AUTH;

mod cram_md5;
mod plain;

pub use cram_md5::AuthCramMd5;
pub use plain::AuthPlain;

/// An authenticated identity, produced by a successful AUTH exchange.
pub trait Principal: Send + Sync {
    /// Does `value` identify this user? MAIL uses this to refuse senders
    /// impersonating another mailbox.
    fn is_user(&self, value: &str) -> bool;

    /// Clear-text password, needed by challenge-response mechanisms
    /// (CRAM-MD5). Mechanisms that never read it may return an empty string.
    fn password(&self) -> String;
}

/// One SASL mechanism (PLAIN, CRAM-MD5, ...).
#[async_trait::async_trait]
pub trait AuthMechanism: Send + Sync {
    /// Run the mechanism's sub-dialogue on the connection.
    ///
    /// `initial` is the optional initial-response from the AUTH command
    /// line; mechanisms send a 334 continuation when they need more.
    ///
    /// # Errors
    ///
    /// * a coded [`SmtpError`] (535 bad credentials, 538 missing TLS,
    ///   501 cancelled) or any transport error
    async fn authenticate(
        &self,
        conn: &mut Connection,
        initial: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn Principal>>;
}

/// The AUTH verb handler: a case-insensitive registry of mechanisms.
#[derive(Default)]
pub struct Auth {
    mechanisms: std::collections::BTreeMap<String, Box<dyn AuthMechanism>>,
}

impl Auth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mechanism under its SASL name.
    ///
    /// # Errors
    ///
    /// * the mechanism is already registered
    pub fn extend(
        &mut self,
        mechanism: &str,
        extension: Box<dyn AuthMechanism>,
    ) -> anyhow::Result<()> {
        let mechanism = mechanism.to_uppercase();
        if self.mechanisms.contains_key(&mechanism) {
            anyhow::bail!("AUTH mechanism {} is already implemented", mechanism);
        }
        self.mechanisms.insert(mechanism, extension);
        Ok(())
    }

    /// The mechanism list advertised on the EHLO `AUTH` capability line.
    #[must_use]
    pub fn ehlo_token(&self) -> String {
        self.mechanisms
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Dispatch `AUTH <MECH> [initial-response]` to the named mechanism.
    ///
    /// # Errors
    ///
    /// * 500-coded error for an unknown mechanism, or whatever the
    ///   mechanism itself fails with
    pub async fn handle(
        &self,
        conn: &mut Connection,
        args: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn Principal>> {
        let (mechanism, initial) = match args.split_once(' ') {
            Some((mechanism, initial)) => (mechanism, initial),
            None => (args, ""),
        };

        let Some(extension) = self.mechanisms.get(&mechanism.to_uppercase()) else {
            return Err(SmtpError::new(
                500,
                format!("AUTH mechanism {mechanism} not available"),
            )
            .into());
        };

        log::info!(target: AUTH, "{} negotiating {}", conn.client_addr, mechanism);
        extension.authenticate(conn, initial).await
    }
}
