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

//! Shared harness: in-memory sessions over duplex streams, a recording
//! message handler, and a minimal scripted SMTP client.

#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use smtpd::{Connection, Message, OnMessage, Server};

pub const CLIENT_ADDR: &str = "127.0.0.1:0";

/// Message handler that records everything it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    messages: std::sync::Arc<std::sync::Mutex<Vec<Message>>>,
}

impl Recorder {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OnMessage for Recorder {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Feed a scripted client dialogue to a fresh plain-text session and return
/// everything the server wrote.
pub async fn run_session(server: &Server, input: &str) -> String {
    let (client, server_end) = tokio::io::duplex(1 << 20);
    let conn = Connection::new(
        server_end,
        CLIENT_ADDR.parse().unwrap(),
        std::sync::Arc::new(server.config().clone()),
    );
    run_session_inner(server, conn, client, input).await
}

/// Same as [`run_session`] on a connection that is TLS from the first byte.
pub async fn run_tunneled_session(server: &Server, input: &str) -> String {
    let (client, server_end) = tokio::io::duplex(1 << 20);
    let conn = Connection::tunneled(
        server_end,
        CLIENT_ADDR.parse().unwrap(),
        std::sync::Arc::new(server.config().clone()),
    );
    run_session_inner(server, conn, client, input).await
}

async fn run_session_inner(
    server: &Server,
    mut conn: Connection,
    mut client: tokio::io::DuplexStream,
    input: &str,
) -> String {
    client.write_all(input.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    server
        .handle_connection(&mut conn)
        .await
        .expect("session must end without a transport error");

    // closing the server end lets the drain below hit end-of-stream
    drop(conn);

    let mut output = String::new();
    client.read_to_string(&mut output).await.unwrap();
    output
}

/// The reply lines of a captured session, CRLF terminators stripped.
pub fn reply_lines(output: &str) -> Vec<&str> {
    output
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .collect()
}

/// Minimal line-oriented SMTP client for interactive tests, generic over the
/// stream so the same code drives clear-text and TLS sessions.
pub struct Client<S> {
    pub stream: S,
    buffer: Vec<u8>,
}

impl<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: vec![],
        }
    }

    /// Hand back the raw stream, e.g. to wrap it in a TLS connector.
    /// Any bytes buffered beyond the last read line are dropped.
    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn read_line(&mut self) -> String {
        loop {
            if let Some(i) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8(self.buffer[..i].to_vec()).unwrap();
                self.buffer.drain(..i + 2);
                return line;
            }
            let mut data = [0_u8; 1024];
            let read = self.stream.read(&mut data).await.unwrap();
            assert!(read > 0, "server closed the connection mid-line");
            self.buffer.extend_from_slice(&data[..read]);
        }
    }

    /// Read a whole reply, following `250-` style continuation lines until
    /// the final `<code><space>` line.
    pub async fn read_reply(&mut self) -> Vec<String> {
        let mut lines = vec![];
        loop {
            let line = self.read_line().await;
            let done = line.len() < 4 || line.as_bytes()[3] != b'-';
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
        self.stream.flush().await.unwrap();
    }
}

/// Spawn a server session over a duplex pipe and hand the client end back.
pub fn spawn_session(
    server: Server,
) -> (Client<tokio::io::DuplexStream>, tokio::task::JoinHandle<()>) {
    spawn_session_inner(server, false)
}

/// Same as [`spawn_session`] with the server side already under TLS.
pub fn spawn_tunneled_session(
    server: Server,
) -> (Client<tokio::io::DuplexStream>, tokio::task::JoinHandle<()>) {
    spawn_session_inner(server, true)
}

fn spawn_session_inner(
    server: Server,
    tunneled: bool,
) -> (Client<tokio::io::DuplexStream>, tokio::task::JoinHandle<()>) {
    let (client, server_end) = tokio::io::duplex(1 << 20);
    let handle = tokio::spawn(async move {
        let config = std::sync::Arc::new(server.config().clone());
        let addr = CLIENT_ADDR.parse().unwrap();
        let mut conn = if tunneled {
            Connection::tunneled(server_end, addr, config)
        } else {
            Connection::new(server_end, addr, config)
        };
        if let Err(error) = server.handle_connection(&mut conn).await {
            // TLS handshake failures and client hangups land here; the
            // individual test decides whether that is expected
            eprintln!("session ended with: {error:#}");
        }
    });
    (Client::new(client), handle)
}
