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

#![allow(dead_code)]

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

mod probe;
mod support;

#[cfg(test)]
mod test_data;

use std::path::PathBuf;
use std::time::Duration;

use log::error;
use structopt::StructOpt;

use crate::probe::{
    deliver::deliver,
    model::{Endpoint, Envelope, TransportMode},
    transcript::Transcript,
};
use crate::support::{config::ProbeConfig, error::Error, sysexits::*};

/// Submit one test message to a mail-submission service and verify that the
/// server accepted it.
///
/// Exactly one delivery is attempted per invocation; there are no retries.
/// The exit code follows sysexits.h conventions, with EX_TEMPFAIL (75) for
/// conditions worth retrying later and EX_PROTOCOL (76) for permanent
/// rejections.
///
/// Configuration is read from the file given by --config (if any),
/// overridden by SMTPPROBE_* environment variables, overridden in turn by
/// the options below.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// Path to the probe configuration file.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// The host the mail-submission listener runs on.
    #[structopt(long)]
    host: Option<String>,

    /// The port to connect to [default: 587 for starttls, 465 for tls].
    #[structopt(short, long)]
    port: Option<u16>,

    /// Transport mode: "starttls" (connect cleartext, then upgrade) or
    /// "tls" (encrypted from the first byte).
    #[structopt(long)]
    mode: Option<TransportMode>,

    /// The envelope sender address.
    #[structopt(long)]
    sender: Option<String>,

    /// An envelope recipient address. May be given more than once.
    #[structopt(long = "recipient", number_of_values = 1)]
    recipients: Vec<String>,

    /// The per-command deadline, in seconds [default: 30].
    #[structopt(long)]
    timeout: Option<u64>,

    /// Require the server certificate to chain to a trusted root.
    #[structopt(long)]
    verify_certificate: bool,

    /// Read the message content from this file instead of sending the
    /// built-in test message.
    #[structopt(long, parse(from_os_str))]
    message_file: Option<PathBuf>,

    /// Log at debug level and print the session transcript even on success.
    #[structopt(short, long)]
    verbose: bool,
}

fn main() {
    let Options {
        config,
        host,
        port,
        mode,
        sender,
        recipients,
        timeout,
        verify_certificate,
        message_file,
        verbose,
    } = Options::from_args();

    init_log(verbose);

    let mut cfg = match config {
        Some(ref path) => match ProbeConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("Failed to load {}: {e}", path.display());
                EX_CONFIG.exit()
            },
        },
        None => ProbeConfig::default(),
    };
    cfg.apply_env();

    if let Some(host) = host {
        cfg.endpoint.host = host;
    }
    if let Some(port) = port {
        cfg.endpoint.port = Some(port);
    }
    if let Some(mode) = mode {
        cfg.endpoint.mode = mode;
    }
    if let Some(timeout) = timeout {
        cfg.endpoint.command_timeout_secs = timeout;
    }
    if verify_certificate {
        cfg.endpoint.verify_certificate = true;
    }
    if let Some(sender) = sender {
        cfg.envelope.sender = sender;
    }
    if !recipients.is_empty() {
        cfg.envelope.recipients = recipients;
    }

    if cfg.envelope.sender.is_empty() {
        error!(
            "No sender address configured; use --sender, SMTPPROBE_SENDER, \
             or the configuration file"
        );
        EX_USAGE.exit()
    }
    if cfg.envelope.recipients.is_empty() {
        error!(
            "No recipient addresses configured; use --recipient, \
             SMTPPROBE_RECIPIENT, or the configuration file"
        );
        EX_USAGE.exit()
    }

    let mut endpoint = Endpoint::new(
        cfg.endpoint.host,
        cfg.endpoint
            .port
            .unwrap_or_else(|| cfg.endpoint.mode.default_port()),
        cfg.endpoint.mode,
    );
    endpoint.command_timeout =
        Duration::from_secs(cfg.endpoint.command_timeout_secs);
    endpoint.verify_certificate = cfg.endpoint.verify_certificate;
    endpoint.helo_name = cfg.endpoint.helo_name;

    let envelope = match message_file {
        Some(ref path) => match std::fs::read(path) {
            Ok(body) => Envelope::new(
                cfg.envelope.sender,
                cfg.envelope.recipients,
                body,
            ),
            Err(e) => {
                error!("Failed to read {}: {e}", path.display());
                EX_NOINPUT.exit()
            },
        },
        None => Envelope::smoke_test(
            &cfg.envelope.sender,
            &cfg.envelope.recipients,
        ),
    };

    let mut transcript = Transcript::new();
    match run(&endpoint, &envelope, &mut transcript) {
        Ok(()) => {
            if verbose {
                print!("{transcript}");
            }
            println!(
                "Message accepted by {}:{}",
                endpoint.host, endpoint.port,
            );
        },

        Err(e) => {
            eprint!("{transcript}");
            error!("Delivery failed: {e}");

            let temporary = e.is_temporary();
            let exit_code = match e {
                Error::InvalidEnvelope(..) => EX_DATAERR,
                Error::Connection { .. } | Error::Timeout { .. } => {
                    EX_TEMPFAIL
                },
                Error::Ssl(..) => EX_UNAVAILABLE,
                Error::UpgradeRejected { .. } | Error::Protocol { .. } => {
                    if temporary {
                        EX_TEMPFAIL
                    } else {
                        EX_PROTOCOL
                    }
                },
            };
            exit_code.exit()
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(
    endpoint: &Endpoint,
    envelope: &Envelope,
    transcript: &mut Transcript,
) -> Result<(), Error> {
    deliver(endpoint, envelope, transcript).await
}

fn init_log(verbose: bool) {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}][{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message,
            ))
        })
        .level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .chain(std::io::stderr())
        .apply()
        .unwrap();
}

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message,
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply()
            .unwrap();
    })
}
