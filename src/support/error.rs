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

use std::fmt;
use std::io;

use thiserror::Error;

/// The stage of the delivery sequence an error is attributed to.
///
/// Stages are strictly ordered and non-repeating; a session runs each of
/// them at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Connect,
    Banner,
    Greeting,
    Upgrade,
    MailFrom,
    RcptTo,
    Data,
    Quit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Stage::Connect => "connect",
            Stage::Banner => "banner",
            Stage::Greeting => "EHLO",
            Stage::Upgrade => "STARTTLS",
            Stage::MailFrom => "MAIL FROM",
            Stage::RcptTo => "RCPT TO",
            Stage::Data => "DATA",
            Stage::Quit => "QUIT",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The envelope was rejected before any network activity took place.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    /// The endpoint could not be reached, or the transport failed under us
    /// mid-session.
    #[error("connection error during {stage}: {source}")]
    Connection {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    /// The per-command deadline elapsed.
    #[error("timed out during {stage}")]
    Timeout { stage: Stage },
    /// The server refused to upgrade the connection to TLS.
    #[error("server refused STARTTLS: {code} {message}")]
    UpgradeRejected { code: u16, message: String },
    /// The server rejected a stage of the submission. `message` is the final
    /// reply line, verbatim.
    #[error("server rejected {stage}: {code} {message}")]
    Protocol {
        stage: Stage,
        code: u16,
        message: String,
    },
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
}

impl Error {
    /// Whether retrying later could plausibly succeed.
    ///
    /// Unreachable or unresponsive servers and 4xx replies are temporary
    /// conditions; 5xx replies and local envelope problems are not.
    pub fn is_temporary(&self) -> bool {
        match *self {
            Error::Connection { .. } | Error::Timeout { .. } => true,
            Error::UpgradeRejected { code, .. }
            | Error::Protocol { code, .. } => (400..500).contains(&code),
            Error::InvalidEnvelope(..) | Error::Ssl(..) => false,
        }
    }
}
