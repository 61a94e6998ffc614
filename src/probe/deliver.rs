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

use std::io;

use log::debug;

use super::{
    model::{Endpoint, Envelope, TransportMode},
    transact::{self, TlsParams},
    transcript::Transcript,
};
use crate::support::{
    error::{Error, Stage},
    session_io::SessionIo,
};

/// Performs one delivery attempt against `endpoint`.
///
/// Exactly one outbound connection is opened, and it is closed on every
/// exit path. Nothing is retried; the caller gets exactly one answer for
/// exactly one attempt. On failure, the error identifies the stage that
/// failed and carries the server's stated reason where one exists.
/// `transcript` records the full exchange either way.
///
/// The envelope is checked locally before any network activity, so a
/// malformed envelope never results in a connection.
pub async fn deliver(
    endpoint: &Endpoint,
    envelope: &Envelope,
    transcript: &mut Transcript,
) -> Result<(), Error> {
    envelope.validate()?;

    debug!("Connecting to {}:{}", endpoint.host, endpoint.port);
    transcript.line(format_args!(
        "Connecting to {}:{}",
        endpoint.host, endpoint.port,
    ));
    let connect = tokio::time::timeout(
        endpoint.command_timeout,
        tokio::net::TcpStream::connect((&*endpoint.host, endpoint.port)),
    )
    .await;
    let sock = match connect {
        Err(_elapsed) => {
            transcript.line(format_args!("Connection timed out"));
            return Err(Error::Timeout {
                stage: Stage::Connect,
            });
        },
        Ok(Err(e)) => {
            transcript.line(format_args!("Failed to connect: {e}"));
            return Err(Error::Connection {
                stage: Stage::Connect,
                source: e,
            });
        },
        Ok(Ok(sock)) => sock,
    };

    // Convert back to a plain socket; we drive the non-blocking machinery
    // ourselves so that OpenSSL can be layered in mid-stream.
    let sock = sock.into_std().map_err(|e| Error::Connection {
        stage: Stage::Connect,
        source: e,
    })?;
    let cxn = SessionIo::new_owned_socket(sock).map_err(|e| {
        Error::Connection {
            stage: Stage::Connect,
            source: io::Error::from_raw_os_error(e as i32),
        }
    })?;
    transcript.line(format_args!("Connection established"));

    let upgrade = match endpoint.mode {
        TransportMode::Starttls => Some(TlsParams {
            server_name: &endpoint.host,
            verify_certificate: endpoint.verify_certificate,
        }),

        // In this mode encryption precedes the first protocol byte, so the
        // handshake happens before the transaction is allowed to start.
        TransportMode::ImplicitTls => {
            debug!("Performing implicit TLS handshake");
            transcript.line(format_args!("<> Performing TLS handshake"));
            let connector =
                transact::ssl_connector(endpoint.verify_certificate)?;
            let handshake = tokio::time::timeout(
                endpoint.command_timeout,
                cxn.ssl_connect(&endpoint.host, &connector),
            )
            .await;
            match handshake {
                Err(_elapsed) => {
                    transcript
                        .line(format_args!("<> TLS handshake timed out"));
                    return Err(Error::Timeout {
                        stage: Stage::Connect,
                    });
                },
                Ok(Err(e)) => {
                    transcript
                        .line(format_args!("<> TLS handshake failed: {e}"));
                    return Err(Error::Connection {
                        stage: Stage::Connect,
                        source: e,
                    });
                },
                Ok(Ok(())) => (),
            }
            transcript.line(format_args!("<> TLS handshake succeeded"));
            None
        },
    };

    debug!("Starting SMTP transaction");
    transact::execute(
        cxn,
        transcript,
        envelope,
        upgrade,
        &endpoint.helo_name,
        endpoint.command_timeout,
    )
    .await
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::test_data;

    fn test_envelope() -> Envelope {
        Envelope::new(
            "probe@example.org",
            vec!["postmaster@example.org".to_owned()],
            &b"Subject: Test email\r\n\r\n\
               The quick brown fox jumps over the brown lazy dog.\r\n"[..],
        )
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_deliver(
        endpoint: &Endpoint,
        envelope: &Envelope,
    ) -> Result<(), Error> {
        crate::init_test_log();

        let mut transcript = Transcript::new();
        let result = deliver(endpoint, envelope, &mut transcript).await;
        println!("Transcript:\n{transcript}");
        result
    }

    fn spawn_server(
        serve: impl FnOnce(TcpListener) + Send + 'static,
    ) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || serve(listener));
        (port, handle)
    }

    fn read_line(stream: &mut impl Read) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if 0 == stream.read(&mut byte).unwrap() {
                break;
            }
            line.push(byte[0]);
            if b'\n' == byte[0] {
                break;
            }
        }
        String::from_utf8(line).unwrap()
    }

    fn expect_line(stream: &mut impl Read, expected: &str) {
        assert_eq!(format!("{expected}\r\n"), read_line(stream));
    }

    fn read_message_content(stream: &mut impl Read) {
        while ".\r\n" != read_line(stream) {}
    }

    fn assert_hangup(stream: &mut impl Read) {
        let mut byte = [0u8; 1];
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => (),
            Ok(_) => panic!("client kept talking after the session"),
        }
    }

    fn test_acceptor() -> openssl::ssl::SslAcceptor {
        let mut builder = openssl::ssl::SslAcceptor::mozilla_intermediate_v5(
            openssl::ssl::SslMethod::tls_server(),
        )
        .unwrap();
        builder
            .set_private_key(&test_data::CERTIFICATE_PRIVATE_KEY)
            .unwrap();
        builder.set_certificate(&test_data::CERTIFICATE).unwrap();
        builder.build()
    }

    /// Serves everything from (re-)greeting through QUIT over an
    /// already-set-up stream.
    fn serve_submission(
        stream: &mut (impl Read + Write),
        data_reply: &str,
    ) {
        expect_line(stream, "EHLO localhost");
        stream.write_all(b"250 Hello\r\n").unwrap();
        expect_line(stream, "MAIL FROM:<probe@example.org>");
        stream.write_all(b"250 Ok\r\n").unwrap();
        expect_line(stream, "RCPT TO:<postmaster@example.org>");
        stream.write_all(b"250 Ok\r\n").unwrap();
        expect_line(stream, "DATA");
        stream.write_all(b"354 Go\r\n").unwrap();
        read_message_content(stream);
        stream.write_all(data_reply.as_bytes()).unwrap();

        if data_reply.starts_with("250") {
            expect_line(stream, "QUIT");
            stream.write_all(b"221 Bye\r\n").unwrap();
        }
    }

    fn serve_starttls_session(sock: TcpStream, data_reply: &str) {
        let mut sock = sock;
        sock.write_all(b"220 test server ready\r\n").unwrap();
        expect_line(&mut sock, "EHLO localhost");
        sock.write_all(b"250-Hello\r\n250 STARTTLS\r\n").unwrap();
        expect_line(&mut sock, "STARTTLS");
        sock.write_all(b"220 Go ahead\r\n").unwrap();

        let mut tls = test_acceptor().accept(sock).unwrap();
        serve_submission(&mut tls, data_reply);
        assert_hangup(&mut tls);
    }

    #[test]
    fn empty_recipient_list_rejected_without_connecting() {
        // Port 9 has no listener; touching the network at all would turn
        // this into a Connection error instead.
        let endpoint =
            Endpoint::new("127.0.0.1", 9, TransportMode::Starttls);
        let envelope = Envelope::new("probe@example.org", vec![], "");
        assert_matches!(
            Err(Error::InvalidEnvelope(..)),
            run_deliver(&endpoint, &envelope)
        );
    }

    #[test]
    fn malformed_sender_rejected_without_connecting() {
        let endpoint =
            Endpoint::new("127.0.0.1", 9, TransportMode::Starttls);
        let envelope = Envelope::new(
            "not an address",
            vec!["postmaster@example.org".to_owned()],
            "",
        );
        assert_matches!(
            Err(Error::InvalidEnvelope(..)),
            run_deliver(&endpoint, &envelope)
        );
    }

    #[test]
    fn connection_refused() {
        // Bind a port to learn one that was recently free, then close it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint =
            Endpoint::new("127.0.0.1", port, TransportMode::Starttls);
        assert_matches!(
            Err(Error::Connection {
                stage: Stage::Connect,
                ..
            }),
            run_deliver(&endpoint, &test_envelope())
        );
    }

    #[test]
    fn unresponsive_server_times_out() {
        let (port, handle) = spawn_server(|listener| {
            let (sock, _) = listener.accept().unwrap();
            // Say nothing and wait for the client to give up.
            let mut sock = sock;
            assert_hangup(&mut sock);
        });

        let mut endpoint =
            Endpoint::new("127.0.0.1", port, TransportMode::Starttls);
        endpoint.command_timeout = Duration::from_millis(200);
        assert_matches!(
            Err(Error::Timeout {
                stage: Stage::Banner,
            }),
            run_deliver(&endpoint, &test_envelope())
        );
        handle.join().unwrap();
    }

    #[test]
    fn submits_via_starttls() {
        let (port, handle) = spawn_server(|listener| {
            let (sock, _) = listener.accept().unwrap();
            serve_starttls_session(sock, "250 Queued\r\n");
        });

        let endpoint =
            Endpoint::new("127.0.0.1", port, TransportMode::Starttls);
        run_deliver(&endpoint, &test_envelope()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn submits_via_implicit_tls() {
        let (port, handle) = spawn_server(|listener| {
            let (sock, _) = listener.accept().unwrap();
            // The handshake comes first. Any cleartext protocol byte from
            // the client would scuttle it.
            let mut tls = test_acceptor().accept(sock).unwrap();
            tls.write_all(b"220 test server ready\r\n").unwrap();
            serve_submission(&mut tls, "250 Queued\r\n");
            assert_hangup(&mut tls);
        });

        let endpoint =
            Endpoint::new("127.0.0.1", port, TransportMode::ImplicitTls);
        run_deliver(&endpoint, &test_envelope()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn repeated_deliveries_are_independent() {
        let (port, handle) = spawn_server(|listener| {
            for _ in 0..2 {
                let (sock, _) = listener.accept().unwrap();
                serve_starttls_session(sock, "250 Queued\r\n");
            }
        });

        let endpoint =
            Endpoint::new("127.0.0.1", port, TransportMode::Starttls);
        let envelope = test_envelope();
        run_deliver(&endpoint, &envelope).unwrap();
        run_deliver(&endpoint, &envelope).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn message_rejection_fails_probe_and_closes_connection() {
        let (port, handle) = spawn_server(|listener| {
            let (sock, _) = listener.accept().unwrap();
            serve_starttls_session(sock, "550 Message rejected\r\n");
        });

        let endpoint =
            Endpoint::new("127.0.0.1", port, TransportMode::Starttls);
        assert_matches!(
            Err(Error::Protocol {
                stage: Stage::Data,
                code: 550,
                ..
            }),
            run_deliver(&endpoint, &test_envelope())
        );
        // serve_starttls_session() asserts the client hung up.
        handle.join().unwrap();
    }
}
