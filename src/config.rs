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

/// Tunables of a [`crate::server::Server`].
///
/// All fields have defaults, so a configuration can be built from an empty
/// TOML document, deserialized from a larger application config, or
/// constructed with [`Config::default`] and adjusted field by field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Server name used in the 220 banner and the EHLO greeting.
    #[serde(default = "Config::default_name")]
    pub name: String,
    /// Maximum accepted message size in bytes, advertised as the `SIZE`
    /// EHLO capability. Larger payloads are refused with a 552.
    #[serde(default = "Config::default_max_size")]
    pub max_size: usize,
    /// Number of commands a client may issue on one connection before the
    /// session is administratively closed.
    #[serde(default = "Config::default_max_commands")]
    pub max_commands: usize,
    /// Deadline armed on every read operation.
    #[serde(default = "Config::default_timeout", with = "humantime_serde")]
    pub read_timeout: std::time::Duration,
    /// Deadline armed on every write operation.
    #[serde(default = "Config::default_timeout", with = "humantime_serde")]
    pub write_timeout: std::time::Duration,
    /// Reply to the HELP verb. When unset a generic pointer to the server
    /// owner is sent.
    #[serde(default)]
    pub help_message: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            max_size: Self::default_max_size(),
            max_commands: Self::default_max_commands(),
            read_timeout: Self::default_timeout(),
            write_timeout: Self::default_timeout(),
            help_message: None,
        }
    }
}

impl Config {
    fn default_name() -> String {
        gethostname::gethostname()
            .to_str()
            .unwrap_or("localhost")
            .to_string()
    }

    const fn default_max_size() -> usize {
        131_072
    }

    const fn default_max_commands() -> usize {
        100
    }

    const fn default_timeout() -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }

    /// Parse a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// * the input is not valid TOML, or a field has the wrong shape
    pub fn from_toml(input: &str) -> anyhow::Result<Self> {
        toml::from_str(input).context("failed to parse smtpd configuration")
    }

    /// Set the HELP message, refusing blank or oversized texts.
    ///
    /// # Errors
    ///
    /// * the message is empty, only whitespace, or longer than 100 characters
    pub fn set_help(&mut self, message: impl Into<String>) -> anyhow::Result<()> {
        let message = message.into();
        if message.trim().is_empty() || message.len() > 100 {
            anyhow::bail!(
                "'{}' is not a valid HELP message: must be non-empty and at most 100 characters",
                message
            );
        }
        self.help_message = Some(message);
        Ok(())
    }
}

/// Build a server-side TLS configuration from PEM-encoded material.
///
/// # Errors
///
/// * the certificate chain or the key cannot be parsed
/// * the key does not match any supported format (RSA, PKCS8, SEC1)
pub fn tls_config_from_pem(
    certificate_chain: &str,
    private_key: &str,
) -> anyhow::Result<rustls::ServerConfig> {
    let mut reader = std::io::Cursor::new(certificate_chain);
    let chain = rustls_pemfile::certs(&mut reader)
        .context("failed to parse certificate chain")?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if chain.is_empty() {
        anyhow::bail!("certificate chain is empty");
    }

    let mut reader = std::io::Cursor::new(private_key);
    let key = loop {
        match rustls_pemfile::read_one(&mut reader).context("failed to parse private key")? {
            Some(rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key)) => break rustls::PrivateKey(key),
            Some(_) => continue,
            None => anyhow::bail!("no private key found in the provided PEM"),
        }
    };

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("certificate chain and private key do not form a valid identity")
}

/// Same as [`tls_config_from_pem`], reading the PEM documents from disk.
///
/// # Errors
///
/// * either file cannot be read, or its content is rejected
pub fn tls_config_from_files(
    certificate_path: impl AsRef<std::path::Path>,
    key_path: impl AsRef<std::path::Path>,
) -> anyhow::Result<rustls::ServerConfig> {
    let chain = std::fs::read_to_string(&certificate_path).with_context(|| {
        format!(
            "could not read certificate '{}'",
            certificate_path.as_ref().display()
        )
    })?;
    let key = std::fs::read_to_string(&key_path)
        .with_context(|| format!("could not read key '{}'", key_path.as_ref().display()))?;

    tls_config_from_pem(&chain, &key)
}
