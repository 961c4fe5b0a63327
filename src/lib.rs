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

//! An embeddable RFC 5321 / RFC 2821 SMTP server.
//!
//! The crate accepts connections, drives each one through the ESMTP state
//! machine (EHLO capability negotiation, STARTTLS upgrade, SASL
//! authentication with PLAIN and CRAM-MD5), parses finished DATA payloads
//! into [`Message`] values with a lazily decoded MIME tree, and hands them
//! to an application-supplied [`OnMessage`] handler.
//!
//! ```no_run
//! use smtpd::{Message, OnMessage, Server};
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl OnMessage for Printer {
//!     async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
//!         println!("{}: {}", message.from.address, message.subject);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Server::new(Printer).listen_and_serve("0.0.0.0:2525").await
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod auth;
mod config;
mod connection;
mod error;
mod extension;
mod message;
mod server;

pub use auth::{Auth, AuthCramMd5, AuthMechanism, AuthPlain, Principal};
pub use config::{tls_config_from_files, tls_config_from_pem, Config};
pub use connection::{AsyncReadAndWrite, BoxedAsyncReadAndWrite, Connection};
pub use error::SmtpError;
pub use extension::{Extension, ExtensionFuture, SimpleExtension};
pub use message::{Address, ContentType, Headers, Message, Part};
pub use server::{OnMessage, Server};

/// targets for the log! macros
pub mod log_channel {
    /// connection handling and the command loop
    pub const RECEIVER: &str = "smtpd::receiver";
    /// SASL negotiation
    pub const AUTH: &str = "smtpd::auth";
}
