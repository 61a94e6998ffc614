//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Smtprobe.
//
// Smtprobe is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtprobe is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along
// with Smtprobe. If not, see <http://www.gnu.org/licenses/>.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::probe::syntax;
use crate::support::error::Error;

/// The per-command deadline used when the caller does not configure one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// How the connection to the submission service is encrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Connect in cleartext, then upgrade the session with STARTTLS before
    /// any of the envelope is sent.
    Starttls,
    /// The connection is TLS from the first byte; no command precedes the
    /// handshake.
    #[serde(rename = "tls")]
    ImplicitTls,
}

impl TransportMode {
    /// The conventional submission port for this mode.
    pub fn default_port(self) -> u16 {
        match self {
            TransportMode::Starttls => 587,
            TransportMode::ImplicitTls => 465,
        }
    }
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Starttls
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "starttls" => Ok(TransportMode::Starttls),
            "tls" | "smtps" => Ok(TransportMode::ImplicitTls),
            _ => Err(format!("unknown transport mode: {s}")),
        }
    }
}

/// Where and how to reach the mail-submission service.
///
/// Immutable for the duration of a delivery attempt.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: TransportMode,
    /// The deadline applied to each command/reply exchange. Reset every time
    /// a command is sent.
    pub command_timeout: Duration,
    /// If true, require the server certificate to chain to a trusted root
    /// and match `host`.
    pub verify_certificate: bool,
    /// The name to identify as in EHLO/HELO.
    pub helo_name: String,
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        mode: TransportMode,
    ) -> Self {
        Endpoint {
            host: host.into(),
            port,
            mode,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            verify_certificate: false,
            helo_name: "localhost".to_owned(),
        }
    }
}

/// The sender/recipients/message triple handed to the remote service.
///
/// Constructed once per delivery attempt and never mutated.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    /// The raw message content, transferred byte-for-byte modulo dot
    /// stuffing.
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Envelope {
            sender: sender.into(),
            recipients,
            body: body.into(),
        }
    }

    /// The fixed test message the probe submits when the caller does not
    /// provide a body of its own.
    pub fn smoke_test(sender: &str, recipients: &[String]) -> Self {
        let to = recipients
            .iter()
            .map(|r| format!("<{r}>"))
            .collect::<Vec<_>>()
            .join(", ");
        let body = format!(
            "From: <{sender}>\r\n\
             To: {to}\r\n\
             Subject: Test email\r\n\
             \r\n\
             The quick brown fox jumps over the brown lazy dog.\r\n"
        );
        Self::new(sender, recipients.to_vec(), body)
    }

    /// Checks the envelope for problems which are detectable without
    /// touching the network.
    pub fn validate(&self) -> Result<(), Error> {
        if self.recipients.is_empty() {
            return Err(Error::InvalidEnvelope("no recipients".to_owned()));
        }

        if !syntax::is_valid_address(&self.sender) {
            return Err(Error::InvalidEnvelope(format!(
                "malformed sender address: {:?}",
                self.sender,
            )));
        }

        for recipient in &self.recipients {
            if !syntax::is_valid_address(recipient) {
                return Err(Error::InvalidEnvelope(format!(
                    "malformed recipient address: {recipient:?}",
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_ports_follow_convention() {
        assert_eq!(587, TransportMode::Starttls.default_port());
        assert_eq!(465, TransportMode::ImplicitTls.default_port());
    }

    #[test]
    fn validation_catches_local_problems() {
        assert_matches!(
            Err(Error::InvalidEnvelope(..)),
            Envelope::new("a@b.com", vec![], "").validate()
        );
        assert_matches!(
            Err(Error::InvalidEnvelope(..)),
            Envelope::new("not-an-address", vec!["a@b.com".to_owned()], "")
                .validate()
        );
        assert_matches!(
            Err(Error::InvalidEnvelope(..)),
            Envelope::new(
                "a@b.com",
                vec!["a@b.com".to_owned(), "bad recipient".to_owned()],
                "",
            )
            .validate()
        );
        assert_matches!(
            Ok(()),
            Envelope::new("a@b.com", vec!["c@d.com".to_owned()], "")
                .validate()
        );
    }

    #[test]
    fn smoke_test_message_is_crlf_clean() {
        let envelope = Envelope::smoke_test(
            "zim@earth.com",
            &["tallest@irk.com".to_owned(), "gir@irk.com".to_owned()],
        );
        let body = String::from_utf8(envelope.body.clone()).unwrap();

        assert!(body.starts_with("From: <zim@earth.com>\r\n"));
        assert!(body.contains("To: <tallest@irk.com>, <gir@irk.com>\r\n"));
        assert!(body.ends_with("\r\n"));
        assert!(!body.replace("\r\n", "").contains(['\r', '\n']));
        assert_matches!(Ok(()), envelope.validate());
    }
}
