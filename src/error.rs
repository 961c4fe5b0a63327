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

/// An error carrying the three-digit SMTP reply code that should be sent to
/// the client.
///
/// Every fallible boundary of the crate (authentication mechanisms, the
/// application message handler, extensions) may return one of these inside an
/// [`anyhow::Error`]; the session loop recovers it with
/// [`SmtpError::from_anyhow`] and replies with the embedded code instead of a
/// generic failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SmtpError {
    /// SMTP 3-digit reply code
    pub code: u16,
    /// the textual portion of the reply
    pub message: String,
}

impl SmtpError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 535, invalid credentials
    #[must_use]
    pub fn auth_failed() -> Self {
        Self::new(535, "Authentication credentials invalid")
    }

    /// 501, the client aborted a SASL exchange with `*`
    #[must_use]
    pub fn auth_cancelled() -> Self {
        Self::new(501, "Cancelled")
    }

    /// 538, the mechanism refuses to run on a clear-text channel
    #[must_use]
    pub fn requires_tls() -> Self {
        Self::new(538, "Encryption required for requested authentication mechanism")
    }

    /// 501, MAIL while a transaction is open, or DATA without one
    #[must_use]
    pub fn transaction() -> Self {
        Self::new(501, "Transaction unsuccessful")
    }

    /// Walk an [`anyhow::Error`] chain looking for a coded error.
    #[must_use]
    pub fn from_anyhow(error: &anyhow::Error) -> Option<&Self> {
        error.chain().find_map(|e| e.downcast_ref::<Self>())
    }
}
