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

/// A server extension bound to one SMTP verb.
///
/// Registered extensions take precedence over the built-in handling of the
/// same verb, and contribute one capability line to the EHLO response. The
/// handler owns the full exchange for its verb, replies included.
#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    /// Handle one client command carrying the registered verb.
    ///
    /// # Errors
    ///
    /// * any failure; the session loop logs it and keeps the session alive
    async fn handle(&self, conn: &mut Connection, args: &str) -> anyhow::Result<()>;

    /// The capability token advertised after the verb on EHLO.
    fn ehlo(&self) -> String;
}

/// Future returned by a [`SimpleExtension`] handler, borrowing the
/// connection for the duration of the exchange.
pub type ExtensionFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// [`Extension`] built from a handler function and a fixed EHLO token, for
/// verbs that do not warrant a dedicated type.
///
/// ```no_run
/// use smtpd::{Connection, ExtensionFuture, SimpleExtension};
///
/// fn ping<'a>(conn: &'a mut Connection, args: &'a str) -> ExtensionFuture<'a> {
///     Box::pin(async move {
///         conn.write_reply(250, &format!("PONG {args}")).await?;
///         Ok(())
///     })
/// }
///
/// let extension = SimpleExtension::new("ROUNDTRIP", ping);
/// ```
pub struct SimpleExtension {
    handler:
        Box<dyn for<'a> Fn(&'a mut Connection, &'a str) -> ExtensionFuture<'a> + Send + Sync>,
    ehlo: String,
}

impl SimpleExtension {
    pub fn new(
        ehlo: impl Into<String>,
        handler: impl for<'a> Fn(&'a mut Connection, &'a str) -> ExtensionFuture<'a>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            ehlo: ehlo.into(),
        }
    }
}

#[async_trait::async_trait]
impl Extension for SimpleExtension {
    async fn handle(&self, conn: &mut Connection, args: &str) -> anyhow::Result<()> {
        (self.handler)(conn, args).await
    }

    fn ehlo(&self) -> String {
        self.ehlo.clone()
    }
}
