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

use crate::auth::Auth;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::SmtpError;
use crate::extension::Extension;
use crate::log_channel::RECEIVER;
use crate::message::{Address, Message};

/// Application side of the server: receives every message accepted by a
/// completed DATA command.
///
/// Invoked concurrently from every session task, so implementations must be
/// safe for concurrent use. Returning `Ok` acknowledges the message with
/// `250 OK : queued as <id>`; a coded [`SmtpError`] is sent verbatim; any
/// other error becomes a 554.
#[async_trait::async_trait]
pub trait OnMessage: Send + Sync {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

lazy_static::lazy_static! {
    static ref PATH_REGEX: regex::Regex =
        regex::Regex::new(r"<([^@>]+@[^@>]+)>").expect("path regex is valid");
}

/// An RFC 5321 / RFC 2821 server: accepts connections, walks each one
/// through the SMTP state machine, and hands finished messages to the
/// [`OnMessage`] handler.
pub struct Server {
    config: std::sync::Arc<Config>,
    handler: std::sync::Arc<dyn OnMessage>,
    auth: Option<Auth>,
    extensions: std::collections::BTreeMap<String, Box<dyn Extension>>,
    disabled: std::collections::BTreeSet<String>,
    tls_config: Option<std::sync::Arc<rustls::ServerConfig>>,
    listener: Option<tokio::net::TcpListener>,
}

impl Server {
    pub fn new(handler: impl OnMessage + 'static) -> Self {
        Self::with_config(handler, Config::default())
    }

    pub fn with_config(handler: impl OnMessage + 'static, config: Config) -> Self {
        Self {
            config: std::sync::Arc::new(config),
            handler: std::sync::Arc::new(handler),
            auth: None,
            extensions: std::collections::BTreeMap::new(),
            disabled: std::collections::BTreeSet::new(),
            tls_config: None,
            listener: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enable STARTTLS with the given server-side TLS configuration.
    pub fn use_tls(&mut self, tls_config: rustls::ServerConfig) {
        self.tls_config = Some(std::sync::Arc::new(tls_config));
    }

    /// Enable STARTTLS from PEM files on disk.
    ///
    /// # Errors
    ///
    /// * the files cannot be read or do not form a valid identity
    pub fn use_tls_files(
        &mut self,
        certificate_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> anyhow::Result<()> {
        self.use_tls(crate::config::tls_config_from_files(
            certificate_path,
            key_path,
        )?);
        Ok(())
    }

    /// Require authentication: the AUTH verb is served by `auth`, and every
    /// mail-handling verb is gated behind a successful login.
    pub fn use_auth(&mut self, auth: Auth) {
        self.auth = Some(auth);
    }

    /// Register an extension for a verb, overriding any built-in handling.
    ///
    /// # Errors
    ///
    /// * the verb is already extended
    pub fn extend(&mut self, verb: &str, extension: Box<dyn Extension>) -> anyhow::Result<()> {
        let verb = verb.to_uppercase();
        if self.extensions.contains_key(&verb) {
            anyhow::bail!("extension for {} has already been registered", verb);
        }
        self.extensions.insert(verb, extension);
        Ok(())
    }

    /// Administratively disable verbs (built-in or extended).
    pub fn disable(&mut self, verbs: &[&str]) {
        for verb in verbs {
            self.disabled.insert(verb.to_uppercase());
        }
    }

    /// Re-enable previously disabled verbs.
    pub fn enable(&mut self, verbs: &[&str]) {
        for verb in verbs {
            self.disabled.remove(&verb.to_uppercase());
        }
    }

    /// Bind the listening socket. Returns the bound address, which tests and
    /// embedders use to learn the ephemeral port.
    ///
    /// # Errors
    ///
    /// * the address cannot be bound
    pub async fn bind(&mut self, addr: &str) -> anyhow::Result<std::net::SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {addr}"))?;
        let local_addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local_addr)
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Accept connections forever, one spawned task per client.
    ///
    /// # Errors
    ///
    /// * [`Server::bind`] was never called
    pub async fn serve(self: std::sync::Arc<Self>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .as_ref()
            .context("serve() called before bind()")?;

        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    log::info!(target: RECEIVER, "connection from {}", client_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        let begin = std::time::SystemTime::now();
                        let mut conn =
                            Connection::new(stream, client_addr, server.config.clone());
                        match server.handle_connection(&mut conn).await {
                            Ok(()) => log::info!(
                                target: RECEIVER,
                                "{{ elapsed: {:?} }} connection {} closed cleanly",
                                begin.elapsed(),
                                client_addr,
                            ),
                            Err(error) => log::error!(
                                target: RECEIVER,
                                "{{ elapsed: {:?} }} connection {} closed with an error: {}",
                                begin.elapsed(),
                                client_addr,
                                error,
                            ),
                        }
                    });
                }
                Err(error) => {
                    log::error!(target: RECEIVER, "error accepting socket: {}", error);
                }
            }
        }
    }

    /// Bind and serve in one call.
    ///
    /// # Errors
    ///
    /// * see [`Server::bind`] and [`Server::serve`]
    pub async fn listen_and_serve(mut self, addr: &str) -> anyhow::Result<()> {
        self.bind(addr).await?;
        std::sync::Arc::new(self).serve().await
    }
}

impl Server {
    /// Run one client session to completion: banner, command loop, verb
    /// dispatch, until QUIT, disconnect, or the command bound.
    ///
    /// # Errors
    ///
    /// * unrecoverable transport errors; protocol violations are answered
    ///   in-band and never escape this loop
    pub async fn handle_connection(&self, conn: &mut Connection) -> anyhow::Result<()> {
        conn.write_reply(
            220,
            &format!("{} {}", self.config.name, chrono::Utc::now().to_rfc2822()),
        )
        .await?;

        for _ in 0..self.config.max_commands {
            let (verb, args) = match conn.read_command().await {
                Ok(command) => command,
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    log::info!(
                        target: RECEIVER,
                        "{} read aborted: {}",
                        conn.client_addr,
                        error
                    );
                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            };

            log::trace!(target: RECEIVER, "{} {} {}", conn.client_addr, verb, args);

            // disabled verbs answer before anything else can
            if self.disabled.contains(&verb) {
                if verb == "EHLO" {
                    conn.write_reply(550, "Not implemented").await?;
                } else {
                    conn.write_reply(502, "Command not implemented").await?;
                }
                continue;
            }

            // a server with authentication configured refuses mail-handling
            // verbs until the client has logged in
            if self.auth.is_some() && conn.user.is_none() {
                match verb.as_str() {
                    "AUTH" | "EHLO" | "HELO" | "NOOP" | "RSET" | "QUIT" | "STARTTLS" => {}
                    "*" => {
                        conn.write_reply(501, "Cancelled").await?;
                        continue;
                    }
                    _ => {
                        conn.write_reply(530, "Authentication required").await?;
                        continue;
                    }
                }
            }

            if let Some(extension) = self.extensions.get(&verb) {
                if let Err(error) = extension.handle(conn, &args).await {
                    log::error!(
                        target: RECEIVER,
                        "extension {} failed: {}",
                        verb,
                        error
                    );
                }
                continue;
            }

            match verb.as_str() {
                "HELO" => {
                    conn.write_reply(250, &format!("{} Hello", self.config.name))
                        .await?;
                }
                "EHLO" => {
                    // a fresh EHLO aborts any transaction and logs the user out
                    conn.reset();

                    conn.write_ehlo_line(&format!(
                        "{} Welcome! [{}]",
                        self.config.name, conn.client_addr
                    ))
                    .await?;
                    conn.write_ehlo_line(&format!("SIZE {}", self.config.max_size))
                        .await?;
                    if !conn.is_tls && self.tls_config.is_some() {
                        conn.write_ehlo_line("STARTTLS").await?;
                    }
                    if let Some(auth) = &self.auth {
                        if conn.user.is_none() {
                            conn.write_ehlo_line(&format!("AUTH {}", auth.ehlo_token()))
                                .await?;
                        }
                    }
                    for (verb, extension) in &self.extensions {
                        conn.write_ehlo_line(&format!("{} {}", verb, extension.ehlo()))
                            .await?;
                    }
                    conn.write_reply(250, "HELP").await?;
                }
                "MAIL" => match Self::address_arg("FROM", &args) {
                    Ok(from) => {
                        let permitted = conn
                            .user
                            .as_ref()
                            .map_or(true, |user| user.is_user(&from.address));
                        if !permitted {
                            conn.write_reply(501, &format!("Cannot send mail as {from}"))
                                .await?;
                        } else if let Err(error) = conn.start_tx(from) {
                            conn.write_reply(error.code, &error.message).await?;
                        } else {
                            conn.write_reply(250, "Accepted").await?;
                        }
                    }
                    Err(error) => conn.write_reply(501, &error.to_string()).await?,
                },
                "RCPT" => match Self::address_arg("TO", &args) {
                    Ok(to) => {
                        conn.to_addr.push(to);
                        conn.write_reply(250, "Accepted").await?;
                    }
                    Err(error) => conn.write_reply(501, &error.to_string()).await?,
                },
                "DATA" => self.handle_data(conn).await?,
                "RSET" => {
                    conn.reset();
                    conn.write_reply(250, "OK").await?;
                }
                // never confirms an address (harvesting channel)
                "VRFY" => {
                    conn.write_reply(252, "Cannot VRFY user, but will accept message")
                        .await?;
                }
                "EXPN" => {
                    conn.write_reply(252, "Cannot EXPN mailing lists").await?;
                }
                "HELP" => {
                    let message = self.config.help_message.clone().unwrap_or_else(|| {
                        format!("contact the owner of {} for more information", self.config.name)
                    });
                    conn.write_reply(214, &message).await?;
                }
                "NOOP" => conn.write_reply(250, "OK").await?,
                "QUIT" => {
                    conn.write_reply(221, "Bye").await?;
                    return Ok(());
                }
                "STARTTLS" => {
                    let Some(tls_config) = &self.tls_config else {
                        conn.write_reply(454, "TLS not available due to temporary reason")
                            .await?;
                        continue;
                    };
                    if conn.is_tls {
                        conn.write_reply(501, "TLS is already active").await?;
                        continue;
                    }
                    conn.write_reply(220, "Ready to start TLS").await?;
                    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config.clone());
                    conn.upgrade_tls(acceptor).await?;
                }
                "AUTH" => {
                    if conn.user.is_some() {
                        conn.write_reply(503, "You are already authenticated").await?;
                    } else if let Some(auth) = &self.auth {
                        match auth.handle(conn, &args).await {
                            Ok(user) => {
                                conn.user = Some(user);
                                conn.write_reply(235, "Authentication succeeded").await?;
                            }
                            Err(error) => match SmtpError::from_anyhow(&error) {
                                Some(coded) => {
                                    conn.write_reply(coded.code, &coded.message).await?;
                                }
                                None => {
                                    log::warn!(
                                        target: RECEIVER,
                                        "{} authentication error: {}",
                                        conn.client_addr,
                                        error
                                    );
                                    conn.write_reply(500, "Authentication failed").await?;
                                }
                            },
                        }
                    } else {
                        conn.write_reply(502, "Command not implemented").await?;
                    }
                }
                _ => {
                    conn.write_reply(500, "Syntax error, command unrecognised").await?;
                    conn.errors += 1;
                    log::warn!(
                        target: RECEIVER,
                        "{} bad input: {} {}",
                        conn.client_addr,
                        verb,
                        args
                    );
                    if conn.errors > 3 {
                        conn.write_reply(500, "Too many unrecognized commands").await?;
                        return Ok(());
                    }
                }
            }
        }

        // the administrative command bound was reached
        Ok(())
    }

    async fn handle_data(&self, conn: &mut Connection) -> anyhow::Result<()> {
        conn.write_reply(354, "Enter message, ending with \".\" on a line by itself")
            .await?;

        let data = match conn.read_data().await {
            Ok(data) => data,
            Err(error) => {
                // an oversized payload is answered in-band; transport errors
                // only get logged, the next read decides the session's fate
                let _ = conn.end_tx();
                if let Some(coded) = SmtpError::from_anyhow(&error) {
                    conn.write_reply(coded.code, &coded.message).await?;
                } else {
                    log::error!(
                        target: RECEIVER,
                        "{} DATA read error: {}",
                        conn.client_addr,
                        error
                    );
                }
                return Ok(());
            }
        };

        let rcpt = conn.to_addr.clone();
        let tx_was_open = conn.end_tx().is_ok();

        match Message::new(data.as_bytes(), rcpt) {
            Ok(message) if tx_was_open => match self.handler.on_message(&message).await {
                Ok(()) => {
                    conn.write_reply(250, &format!("OK : queued as {}", message.id()))
                        .await?;
                }
                Err(error) => match SmtpError::from_anyhow(&error) {
                    Some(coded) => conn.write_reply(coded.code, &coded.message).await?,
                    None => conn.write_reply(554, &format!("Error: {error}")).await?,
                },
            },
            Ok(_) => {
                let error = SmtpError::transaction();
                conn.write_reply(error.code, &error.message).await?;
            }
            Err(error) => {
                conn.write_reply(554, &format!("Error: {error}")).await?;
            }
        }
        Ok(())
    }

    /// Extract the mailbox from a `FROM:<addr>` / `TO:<addr>` argument.
    ///
    /// Only the angle-bracketed form is accepted; the bracket content goes
    /// through the RFC 5322 address parser.
    fn address_arg(name: &str, args: &str) -> anyhow::Result<Address> {
        let (key, rest) = args.split_once(':').context("Bad arguments")?;
        if !key.eq_ignore_ascii_case(name) {
            anyhow::bail!("Bad arguments");
        }
        let path = PATH_REGEX
            .find(rest)
            .with_context(|| format!("could not find a valid {name} path in '{rest}'"))?;
        Address::parse(path.as_str())
    }
}
