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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::probe::model::TransportMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// The probe configuration, conventionally stored in a file named
/// `probe.toml`.
///
/// Every field has a usable default. `SMTPPROBE_*` environment variables
/// override the file, and command-line arguments override both.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub envelope: EnvelopeConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// The host the mail-submission listener runs on.
    pub host: String,
    /// The port to connect to. If unset, the conventional port for the
    /// transport mode is used (587 for `starttls`, 465 for `tls`).
    pub port: Option<u16>,
    /// `starttls` or `tls`.
    pub mode: TransportMode,
    /// The deadline applied to each command/reply exchange, in seconds.
    pub command_timeout_secs: u64,
    /// Whether to require the server certificate to chain to a trusted
    /// root. Off by default, since the probe typically talks to a listener
    /// bearing a self-signed certificate.
    pub verify_certificate: bool,
    /// The name to present in EHLO/HELO.
    pub helo_name: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: None,
            mode: TransportMode::default(),
            command_timeout_secs: 30,
            verify_certificate: false,
            helo_name: "localhost".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// The envelope sender address.
    pub sender: String,
    /// The envelope recipient addresses.
    pub recipients: Vec<String>,
}

impl ProbeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Overrides configuration values from the process environment.
    ///
    /// This is the only point at which the environment is consulted; nothing
    /// deeper in the delivery logic reads it.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("SMTPPROBE_HOST") {
            self.endpoint.host = host;
        }
        if let Some(port) =
            lookup("SMTPPROBE_PORT").and_then(|p| p.parse().ok())
        {
            self.endpoint.port = Some(port);
        }
        if let Some(mode) =
            lookup("SMTPPROBE_MODE").and_then(|m| m.parse().ok())
        {
            self.endpoint.mode = mode;
        }
        if let Some(sender) = lookup("SMTPPROBE_SENDER") {
            self.envelope.sender = sender;
        }
        if let Some(recipient) = lookup("SMTPPROBE_RECIPIENT") {
            self.envelope.recipients = vec![recipient];
        }
    }
}
