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

use crate::auth::Principal;
use crate::config::Config;
use crate::error::SmtpError;
use crate::log_channel::RECEIVER;
use crate::message::Address;

/// Object-safe alias for the byte streams a session can run over.
pub trait AsyncReadAndWrite:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin
{
}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AsyncReadAndWrite for T {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

/// Deadline of the STARTTLS handshake, independent of the I/O timeouts.
const TLS_HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Growth cap of the line buffer; a client pushing more than this without a
/// line terminator is not speaking SMTP.
const MAX_BUFFERED_LINE: usize = 1024 * 1024;

/// One accepted client connection and its session state.
///
/// The stream is held behind `Option<Box<dyn ..>>` so that STARTTLS can take
/// the clear-text stream out, run the handshake, and put the encrypted stream
/// back without the session loop ever seeing the swap.
pub struct Connection {
    stream: Option<BoxedAsyncReadAndWrite>,
    read_buffer: Vec<u8>,
    config: std::sync::Arc<Config>,

    /// peer socket address
    pub client_addr: std::net::SocketAddr,
    /// true once a STARTTLS handshake succeeded; never reverts
    pub is_tls: bool,
    /// principal established by a successful AUTH
    pub user: Option<std::sync::Arc<dyn Principal>>,
    /// reverse-path of the open transaction
    pub from_addr: Option<Address>,
    /// forward-paths accumulated by RCPT
    pub to_addr: Vec<Address>,
    /// unrecognised-command tally for this session
    pub errors: u64,

    transaction: bool,
}

impl Connection {
    pub fn new(
        stream: impl AsyncReadAndWrite + 'static,
        client_addr: std::net::SocketAddr,
        config: std::sync::Arc<Config>,
    ) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            read_buffer: Vec::with_capacity(1024),
            config,
            client_addr,
            is_tls: false,
            user: None,
            from_addr: None,
            to_addr: vec![],
            errors: 0,
            transaction: false,
        }
    }

    /// A connection that is encrypted from the first byte (SMTPS port 465,
    /// or a unit test that wants TLS-only behaviour without a handshake).
    pub fn tunneled(
        stream: impl AsyncReadAndWrite + 'static,
        client_addr: std::net::SocketAddr,
        config: std::sync::Arc<Config>,
    ) -> Self {
        Self {
            is_tls: true,
            ..Self::new(stream, client_addr, config)
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a MAIL transaction.
    ///
    /// # Errors
    ///
    /// * a transaction is already open
    pub fn start_tx(&mut self, from: Address) -> Result<(), SmtpError> {
        if self.transaction {
            return Err(SmtpError::transaction());
        }
        self.transaction = true;
        self.from_addr = Some(from);
        Ok(())
    }

    /// Close the open MAIL transaction, clearing its paths.
    ///
    /// # Errors
    ///
    /// * no transaction is open
    pub fn end_tx(&mut self) -> Result<(), SmtpError> {
        if !self.transaction {
            return Err(SmtpError::transaction());
        }
        self.transaction = false;
        self.from_addr = None;
        self.to_addr.clear();
        Ok(())
    }

    pub fn is_tx_open(&self) -> bool {
        self.transaction
    }

    /// Drop the authenticated user and any transaction state (RSET, EHLO).
    pub fn reset(&mut self) {
        self.user = None;
        self.from_addr = None;
        self.to_addr.clear();
        self.transaction = false;
    }
}

impl Connection {
    /// Read one CRLF-terminated line, terminator stripped. The read deadline
    /// is armed when the call enters.
    ///
    /// # Errors
    ///
    /// * timeout, EOF, malformed UTF-8, or a transport error
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        let deadline = tokio::time::Instant::now() + self.config.read_timeout;
        self.read_line_at(deadline).await
    }

    async fn read_line_at(&mut self, deadline: tokio::time::Instant) -> std::io::Result<String> {
        loop {
            if let Some(i) = self
                .read_buffer
                .windows(2)
                .position(|window| window == b"\r\n")
            {
                let line = String::from_utf8(self.read_buffer[..i].to_vec()).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                })?;
                self.read_buffer.drain(..i + 2);
                log::trace!(target: RECEIVER, "recv=\"{}\"", line);
                return Ok(line);
            }
            if self.read_buffer.len() > MAX_BUFFERED_LINE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let stream = self.stream.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "stream taken")
            })?;
            let mut data = [0_u8; 1024];
            let read = tokio::time::timeout_at(
                deadline,
                tokio::io::AsyncReadExt::read(stream, &mut data),
            )
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::TimedOut, e))??;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client disconnected",
                ));
            }
            self.read_buffer.extend_from_slice(&data[..read]);
        }
    }

    /// Read a command line and split it into an upper-cased verb and its
    /// arguments.
    ///
    /// # Errors
    ///
    /// * see [`Connection::read_line`]
    pub async fn read_command(&mut self) -> std::io::Result<(String, String)> {
        let line = self.read_line().await?;
        Ok(match line.split_once(' ') {
            Some((verb, args)) => (verb.to_uppercase(), args.to_string()),
            None => (line.to_uppercase(), String::new()),
        })
    }

    /// Read a dot-terminated DATA payload, removing dot-stuffing and joining
    /// the lines with `\n`. A single deadline covers the whole payload.
    ///
    /// # Errors
    ///
    /// * a 552-coded [`SmtpError`] when the payload exceeds `max_size`
    ///   (the payload is still drained up to the terminator)
    /// * see [`Connection::read_line`]
    pub async fn read_data(&mut self) -> anyhow::Result<String> {
        let deadline = tokio::time::Instant::now() + self.config.read_timeout;
        let max_size = self.config.max_size;

        let mut lines = Vec::new();
        let mut received = 0_usize;
        loop {
            let line = self.read_line_at(deadline).await?;
            if line == "." {
                break;
            }
            let line = line.strip_prefix('.').map_or(line.as_str(), |rest| rest);
            received += line.len() + 1;
            if max_size == 0 || received <= max_size {
                lines.push(line.to_string());
            }
        }

        if max_size != 0 && received > max_size {
            return Err(SmtpError::new(
                552,
                format!("Message exceeds fixed maximum message size of {max_size}"),
            )
            .into());
        }
        Ok(lines.join("\n"))
    }

    /// Write `"<code> <text>\r\n"`. The write deadline is armed on entry.
    ///
    /// # Errors
    ///
    /// * timeout or a transport error
    pub async fn write_reply(&mut self, code: u16, text: &str) -> std::io::Result<()> {
        self.write_raw(&format!("{code} {text}\r\n")).await
    }

    /// Write a `250-` continuation line of an EHLO response.
    ///
    /// # Errors
    ///
    /// * timeout or a transport error
    pub async fn write_ehlo_line(&mut self, text: &str) -> std::io::Result<()> {
        self.write_raw(&format!("250-{text}\r\n")).await
    }

    async fn write_raw(&mut self, reply: &str) -> std::io::Result<()> {
        log::trace!(target: RECEIVER, "send=\"{}\"", reply.trim_end());
        let deadline = tokio::time::Instant::now() + self.config.write_timeout;
        let stream = self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "stream taken")
        })?;
        tokio::time::timeout_at(deadline, async {
            tokio::io::AsyncWriteExt::write_all(stream, reply.as_bytes()).await?;
            tokio::io::AsyncWriteExt::flush(stream).await
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::TimedOut, e))?
    }

    /// Run the server side of a TLS handshake over the current stream and
    /// continue the session on the encrypted stream. The authenticated user,
    /// the error tally and the timeouts carry over.
    ///
    /// # Errors
    ///
    /// * the handshake fails or exceeds its 10 second deadline; the
    ///   connection is unusable afterwards and must be dropped
    pub async fn upgrade_tls(
        &mut self,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> anyhow::Result<()> {
        let stream = self
            .stream
            .take()
            .context("stream already taken for an upgrade")?;
        let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;

        // clear-text bytes buffered before the handshake must not be
        // interpreted as part of the encrypted session
        self.read_buffer.clear();
        self.stream.replace(Box::new(tls_stream));
        self.is_tls = true;

        log::info!(target: RECEIVER, "{} upgraded to TLS", self.client_addr);
        Ok(())
    }
}
