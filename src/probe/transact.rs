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

//! The SMTP submission sequence itself, run over an established connection.
//!
//! The caller (`deliver`) is responsible for opening the connection and, in
//! implicit-TLS mode, for completing the handshake before any of this code
//! runs. Everything from the server banner through QUIT happens here.

use std::borrow::Cow;
use std::io;
use std::time::{Duration, Instant};

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{model::Envelope, syntax, transcript::Transcript};
use crate::support::{
    error::{Error, Stage},
    session_io::SessionIo,
};

/// The longest reply line we are prepared to buffer.
const MAX_LINE: usize = 1024;

/// TLS parameters for the STARTTLS upgrade.
pub struct TlsParams<'a> {
    /// The name presented for SNI and, when verification is on, checked
    /// against the certificate.
    pub server_name: &'a str,
    pub verify_certificate: bool,
}

/// Builds the TLS connector used for both the STARTTLS upgrade and
/// implicit-TLS connections.
pub fn ssl_connector(
    verify_certificate: bool,
) -> Result<SslConnector, openssl::error::ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(if verify_certificate {
        SslVerifyMode::PEER
    } else {
        SslVerifyMode::NONE
    });
    Ok(builder.build())
}

/// Executes one SMTP submission over `cxn`, which must be freshly
/// established and not yet have produced any data.
///
/// When `upgrade` is `Some`, the session negotiates STARTTLS after the
/// initial greeting exchange and greets again over the encrypted channel;
/// none of the envelope touches the wire in cleartext. When it is `None`,
/// the session runs over the connection as-is.
///
/// Success means the server positively acknowledged every stage, including
/// acceptance of the message content. Any rejection fails the whole call.
pub async fn execute(
    cxn: SessionIo,
    transcript: &mut Transcript,
    envelope: &Envelope,
    upgrade: Option<TlsParams<'_>>,
    helo_name: &str,
    command_timeout: Duration,
) -> Result<(), Error> {
    let session = Session {
        cxn,
        transcript,
        envelope,
        helo_name,
        command_timeout,
        line_buffer: [0u8; MAX_LINE],
        line_buffer_len: 0,
        command_deadline: Instant::now() + command_timeout,
    };
    session.run(upgrade).await
}

/// The transient state of one submission. Dropping it releases the
/// connection.
struct Session<'a, 'b> {
    cxn: SessionIo,
    transcript: &'a mut Transcript,
    envelope: &'b Envelope,
    helo_name: &'b str,
    command_timeout: Duration,

    line_buffer: [u8; MAX_LINE],
    line_buffer_len: usize,
    /// When the response to the current command must have arrived. Reset
    /// each time a command is sent.
    command_deadline: Instant,
}

#[derive(Clone, Copy, Default)]
struct Capabilities {
    starttls: bool,
}

impl Session<'_, '_> {
    async fn run(mut self, upgrade: Option<TlsParams<'_>>) -> Result<(), Error> {
        self.read_accepted(Stage::Banner).await?;
        let capabilities = self.execute_helo().await?;

        if let Some(ref tls) = upgrade {
            self.negotiate_tls(tls, capabilities).await?;
        }

        let envelope = self.envelope;
        self.send_command(
            Stage::MailFrom,
            &format!("MAIL FROM:<{}>", envelope.sender),
        )
        .await?;
        self.read_accepted(Stage::MailFrom).await?;

        for recipient in &envelope.recipients {
            self.send_command(Stage::RcptTo, &format!("RCPT TO:<{recipient}>"))
                .await?;
            self.read_accepted(Stage::RcptTo).await?;
        }

        self.send_message().await?;

        // The message has been accepted; the probe has its answer. Do the
        // mostly superfluous QUIT exchange, but we don't care what actually
        // happens with it.
        if self.send_command(Stage::Quit, "QUIT").await.is_ok() {
            let _ = self.read_reply(Stage::Quit).await;
        }

        Ok(())
    }

    /// Greets the server with EHLO, falling back to the legacy HELO if EHLO
    /// itself is rejected.
    async fn execute_helo(&mut self) -> Result<Capabilities, Error> {
        let mut capabilities = Capabilities::default();
        let helo_name = self.helo_name;

        self.send_command(Stage::Greeting, &format!("EHLO {helo_name}"))
            .await?;
        let (code, message) = self
            .read_replies(Stage::Greeting, |reply| {
                if "STARTTLS".eq_ignore_ascii_case(reply.text) {
                    capabilities.starttls = true;
                }
            })
            .await?;

        match code {
            200..=299 => return Ok(capabilities),
            // Retry with the legacy greeting.
            500..=504 | 550 => (),
            _ => {
                return Err(Error::Protocol {
                    stage: Stage::Greeting,
                    code,
                    message,
                })
            },
        }

        self.send_command(Stage::Greeting, &format!("HELO {helo_name}"))
            .await?;
        self.read_accepted(Stage::Greeting).await?;
        // A HELO-only server naturally has no extensions.
        Ok(Capabilities::default())
    }

    async fn negotiate_tls(
        &mut self,
        tls: &TlsParams<'_>,
        capabilities: Capabilities,
    ) -> Result<(), Error> {
        if !capabilities.starttls {
            // A server which supports STARTTLS but fails to advertise it is
            // a misconfiguration this probe exists to surface, so ask
            // regardless and let the reply speak for itself.
            self.transcript.line(format_args!(
                "Server did not advertise STARTTLS; requesting the upgrade \
                 anyway"
            ));
        }

        self.send_command(Stage::Upgrade, "STARTTLS").await?;
        let (code, message) = self.read_reply(Stage::Upgrade).await?;
        if !(200..300).contains(&code) {
            return Err(Error::UpgradeRejected { code, message });
        }

        self.transcript.line(format_args!("<> Performing TLS handshake"));
        let connector = ssl_connector(tls.verify_certificate)?;
        let handshake = tokio::time::timeout_at(
            self.command_deadline.into(),
            self.cxn.ssl_connect(tls.server_name, &connector),
        )
        .await;
        match handshake {
            Err(_elapsed) => {
                self.transcript
                    .line(format_args!("<> TLS handshake timed out"));
                return Err(Error::Timeout {
                    stage: Stage::Upgrade,
                });
            },
            Ok(Err(e)) => {
                self.transcript
                    .line(format_args!("<> TLS handshake failed: {e}"));
                return Err(Error::Connection {
                    stage: Stage::Upgrade,
                    source: e,
                });
            },
            Ok(Ok(())) => (),
        }
        self.transcript
            .line(format_args!("<> TLS handshake succeeded"));

        // Nothing learned before the upgrade is to be trusted; greet again
        // over the encrypted channel.
        self.execute_helo().await?;
        Ok(())
    }

    async fn send_message(&mut self) -> Result<(), Error> {
        self.send_command(Stage::Data, "DATA").await?;
        let (code, message) = self.read_reply(Stage::Data).await?;
        match code {
            // 2xx responses are not defined for DATA, but OpenSMTPD's
            // client treats them as equivalent to 354, presumably with good
            // reason.
            200..=299 | 354 => (),
            _ => {
                return Err(Error::Protocol {
                    stage: Stage::Data,
                    code,
                    message,
                })
            },
        }

        let envelope = self.envelope;
        self.extend_command_deadline_for_transfer(envelope.body.len() as u64);
        let result = tokio::time::timeout_at(
            self.command_deadline.into(),
            write_dot_stuffed(&mut self.cxn, &envelope.body),
        )
        .await;
        match result {
            Err(_elapsed) => {
                self.transcript
                    .line(format_args!("Message transfer timed out"));
                return Err(Error::Timeout { stage: Stage::Data });
            },
            Ok(Err(e)) => {
                self.transcript
                    .line(format_args!("I/O error sending message: {e}"));
                return Err(Error::Connection {
                    stage: Stage::Data,
                    source: e,
                });
            },
            Ok(Ok(())) => (),
        }
        self.transcript.line(format_args!(
            "<< [{} bytes, dot-stuffed]",
            envelope.body.len(),
        ));

        self.read_accepted(Stage::Data).await
    }

    /// Sends the given command (sans line ending), resetting the command
    /// deadline.
    async fn send_command(
        &mut self,
        stage: Stage,
        command: &str,
    ) -> Result<(), Error> {
        self.command_deadline = Instant::now() + self.command_timeout;
        let io = async {
            self.cxn.write_all(command.as_bytes()).await?;
            self.cxn.write_all(b"\r\n").await?;
            self.cxn.flush().await?;
            Ok::<(), io::Error>(())
        };

        self.transcript.line(format_args!("<< {command}"));
        match tokio::time::timeout_at(self.command_deadline.into(), io).await
        {
            Err(_elapsed) => {
                self.transcript
                    .line(format_args!("Timed out sending command"));
                Err(Error::Timeout { stage })
            },
            Ok(Err(e)) => {
                self.transcript
                    .line(format_args!("I/O error sending command: {e}"));
                Err(Error::Connection { stage, source: e })
            },
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Reads the next reply, requiring an acceptance (2xx) code.
    async fn read_accepted(&mut self, stage: Stage) -> Result<(), Error> {
        let (code, message) = self.read_reply(stage).await?;
        match code {
            200..=299 => Ok(()),
            _ => Err(Error::Protocol {
                stage,
                code,
                message,
            }),
        }
    }

    /// Reads the next reply, returning the code and text of its final line.
    async fn read_reply(
        &mut self,
        stage: Stage,
    ) -> Result<(u16, String), Error> {
        self.read_replies(stage, |_| ()).await
    }

    /// Reads reply lines up to and including the final one, invoking
    /// `on_line` for each and returning the final code and text.
    async fn read_replies(
        &mut self,
        stage: Stage,
        mut on_line: impl FnMut(&syntax::Reply<'_>),
    ) -> Result<(u16, String), Error> {
        for _ in 0..1000 {
            let (raw_len, line) = self.read_line(stage).await?;
            let parsed = syntax::parse_reply(&line);
            if let Some(ref reply) = parsed {
                on_line(reply);
            }
            let parsed =
                parsed.map(|reply| (reply.code, reply.last, reply.text.to_owned()));
            self.consume_line(raw_len);

            let Some((code, last, text)) = parsed else {
                self.transcript
                    .line(format_args!("Bad reply line from server"));
                return Err(Error::Connection {
                    stage,
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        "malformed reply line",
                    ),
                });
            };

            if last {
                return Ok((code, text));
            }
        }

        self.transcript
            .line(format_args!("Unbounded multiline reply; giving up"));
        Err(Error::Connection {
            stage,
            source: io::Error::new(
                io::ErrorKind::InvalidData,
                "reply never ended",
            ),
        })
    }

    /// Reads from the server until `line_buffer` holds a full line,
    /// returning its raw byte length and its decoded text without the
    /// terminator (a stray \r may remain).
    ///
    /// Decoding is lossy, so the byte length is what `consume_line` must be
    /// given, not the length of the string.
    async fn read_line(
        &mut self,
        stage: Stage,
    ) -> Result<(usize, Cow<'_, str>), Error> {
        loop {
            if let Some(ix) = memchr::memchr(
                b'\n',
                &self.line_buffer[..self.line_buffer_len],
            ) {
                let s = String::from_utf8_lossy(&self.line_buffer[..ix]);
                self.transcript.line(format_args!(">> {:?}", &*s));
                return Ok((ix, s));
            }

            if self.line_buffer_len >= MAX_LINE {
                self.transcript
                    .line(format_args!("Server reply line too long"));
                return Err(Error::Connection {
                    stage,
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        "reply line too long",
                    ),
                });
            }

            match tokio::time::timeout_at(
                self.command_deadline.into(),
                self.cxn.read(&mut self.line_buffer[self.line_buffer_len..]),
            )
            .await
            {
                Err(_elapsed) => {
                    self.transcript
                        .line(format_args!("Timed out reading reply"));
                    return Err(Error::Timeout { stage });
                },
                Ok(Err(e)) => {
                    self.transcript
                        .line(format_args!("I/O error reading reply: {e}"));
                    return Err(Error::Connection { stage, source: e });
                },
                Ok(Ok(0)) => {
                    self.transcript
                        .line(format_args!("Server closed the connection"));
                    return Err(Error::Connection {
                        stage,
                        source: io::ErrorKind::UnexpectedEof.into(),
                    });
                },
                Ok(Ok(n)) => self.line_buffer_len += n,
            }
        }
    }

    /// Removes the first `n` characters and the line ending which follows
    /// them from `line_buffer`.
    fn consume_line(&mut self, n: usize) {
        debug_assert!(n < self.line_buffer_len);
        debug_assert_eq!(b'\n', self.line_buffer[n]);
        self.line_buffer.copy_within(n + 1..self.line_buffer_len, 0);
        self.line_buffer_len -= n + 1;
    }

    /// Extends the command deadline to accommodate transferring `bytes`
    /// bytes, assuming a pessimistic rate of 32kbps.
    fn extend_command_deadline_for_transfer(&mut self, bytes: u64) {
        self.command_deadline = Instant::now()
            + self.command_timeout
            + Duration::from_millis(bytes / 4);
    }
}

/// Writes `body` to `dst` with dot stuffing and the closing ".\r\n".
///
/// Only CRLF line endings count as line boundaries. If the content does not
/// end with a line ending, one is supplied before the terminator.
async fn write_dot_stuffed(
    dst: &mut (impl tokio::io::AsyncWrite + Unpin),
    body: &[u8],
) -> io::Result<()> {
    let mut dst = tokio::io::BufWriter::new(dst);
    let mut start_of_line = true;

    let mut rest = body;
    while !rest.is_empty() {
        let line_end =
            memchr::memchr(b'\n', rest).map_or(rest.len(), |ix| ix + 1);
        let line = &rest[..line_end];

        if start_of_line && Some(&b'.') == line.first() {
            dst.write_all(b".").await?;
        }
        dst.write_all(line).await?;

        start_of_line = line.ends_with(b"\r\n");
        rest = &rest[line_end..];
    }

    if !start_of_line {
        dst.write_all(b"\r\n").await?;
    }
    dst.write_all(b".\r\n").await?;
    dst.flush().await?;

    Ok(())
}
