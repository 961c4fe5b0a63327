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

/// One RFC 5322 mailbox: the address itself plus the optional display
/// phrase (`"Jane Doe" <jane@example.org>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// display phrase, when the mailbox carried one
    pub name: Option<String>,
    /// the bare `local@domain` address
    pub address: String,
}

impl Address {
    /// Parse a single mailbox.
    ///
    /// # Errors
    ///
    /// * the input is not a valid RFC 5322 mailbox, or contains more than one
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let mut list = Self::parse_list(input)?;
        if list.len() != 1 {
            anyhow::bail!("expected exactly one address in '{}'", input);
        }
        Ok(list.remove(0))
    }

    /// Parse a comma-separated RFC 5322 address list, flattening groups.
    ///
    /// # Errors
    ///
    /// * the input is not a valid address list
    pub fn parse_list(input: &str) -> anyhow::Result<Vec<Self>> {
        let parsed = mailparse::addrparse(input)
            .with_context(|| format!("failed to parse address list '{input}'"))?;

        let mut addresses = vec![];
        for entry in parsed.iter() {
            match entry {
                mailparse::MailAddr::Single(single) => addresses.push(Self::from(single)),
                mailparse::MailAddr::Group(group) => {
                    addresses.extend(group.addrs.iter().map(Self::from));
                }
            }
        }
        if addresses.is_empty() {
            anyhow::bail!("no address found in '{}'", input);
        }
        Ok(addresses)
    }

    /// The part before the `@`.
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.address
            .rfind('@')
            .map_or(self.address.as_str(), |at| &self.address[..at])
    }

    /// The domain after the `@`.
    #[must_use]
    pub fn domain(&self) -> &str {
        self.address
            .rfind('@')
            .map_or("", |at| &self.address[at + 1..])
    }
}

impl From<&mailparse::SingleInfo> for Address {
    fn from(single: &mailparse::SingleInfo) -> Self {
        Self {
            name: single.display_name.clone(),
            address: single.addr.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "\"{}\" <{}>", name, self.address),
            None => write!(f, "<{}>", self.address),
        }
    }
}
