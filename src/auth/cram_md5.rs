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
use std::fmt::Write;

use base64::Engine;
use hmac::Mac;

use super::{AuthMechanism, Principal};
use crate::connection::Connection;
use crate::error::SmtpError;
use crate::log_channel::AUTH;

/// User lookup for the challenge-response check; the returned principal's
/// password feeds the HMAC verification.
pub type FindUserFn =
    dyn Fn(&str) -> anyhow::Result<std::sync::Arc<dyn Principal>> + Send + Sync;

/// AUTH CRAM-MD5 (RFC 2195). Refuses to run without TLS.
pub struct AuthCramMd5 {
    find_user: Box<FindUserFn>,
}

impl AuthCramMd5 {
    pub fn new(
        find_user: impl Fn(&str) -> anyhow::Result<std::sync::Arc<dyn Principal>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            find_user: Box::new(find_user),
        }
    }

    /// A fresh challenge in message-id form:
    /// `<base36(time).base36(random)@hostname>`.
    fn challenge() -> String {
        let wall_time = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let hostname = gethostname::gethostname()
            .to_str()
            .unwrap_or("localhost")
            .to_string();

        format!(
            "<{}.{}@{}>",
            to_base36(wall_time),
            to_base36(rand::random::<u64>()),
            hostname
        )
    }

    fn check_response(
        &self,
        response: &str,
        challenge: &str,
    ) -> Option<std::sync::Arc<dyn Principal>> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(response.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, digest) = decoded.split_once(' ')?;

        let user = (self.find_user)(username).ok()?;
        if hmac_md5_hex(&user.password(), challenge) == digest {
            Some(user)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl AuthMechanism for AuthCramMd5 {
    async fn authenticate(
        &self,
        conn: &mut Connection,
        _initial: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn Principal>> {
        if !conn.is_tls {
            return Err(SmtpError::requires_tls().into());
        }

        let challenge = Self::challenge();
        conn.write_reply(
            334,
            &base64::engine::general_purpose::STANDARD.encode(&challenge),
        )
        .await?;

        let line = conn.read_line().await?;
        if line.trim() == "*" {
            log::info!(target: AUTH, "{} cancelled CRAM-MD5", conn.client_addr);
            return Err(SmtpError::auth_cancelled().into());
        }

        match self.check_response(line.trim(), &challenge) {
            Some(user) => Ok(user),
            None => Err(SmtpError::auth_failed().into()),
        }
    }
}

/// Lower-case hex HMAC-MD5 of the challenge under the given secret.
fn hmac_md5_hex(secret: &str, challenge: &str) -> String {
    let mut mac = hmac::Hmac::<md5::Md5>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(challenge.as_bytes());

    mac.finalize()
        .into_bytes()
        .iter()
        .fold(String::with_capacity(32), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = vec![];
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
