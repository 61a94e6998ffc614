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

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::SslStream;
use tokio::io::{
    unix::{AsyncFd, AsyncFdReadyGuard},
    AsyncRead, AsyncWrite, ReadBuf,
};

/// Async I/O over the probe's one outbound socket.
///
/// This exists to support switching the stream from cleartext to TLS
/// mid-session, which the STARTTLS flow requires and which cannot be
/// expressed by layering a TLS stream type over a socket type up front.
///
/// Clones of a `SessionIo` refer to the same underlying connection. The
/// socket is closed when the last clone is dropped, so simply dropping the
/// value is sufficient teardown on every exit path.
///
/// This is not a `Send` structure and must be used with a single-threaded
/// async runtime.
#[derive(Clone)]
pub struct SessionIo {
    fd: Rc<AsyncFd<RawFd>>,
    mode: Rc<RefCell<Mode>>,
    _owner: Rc<dyn Any>,
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
}

impl SessionIo {
    /// Sets up a `SessionIo` which runs over the given socket.
    ///
    /// The socket is owned by the `SessionIo` and is closed once the last
    /// reference is dropped.
    ///
    /// This only fails if making the socket non-blocking fails.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any,
    ) -> Result<Self, nix::Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(
            AsyncFd::with_interest(
                fd,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )
            .unwrap(),
        );

        Ok(Self {
            fd: Rc::clone(&fd),
            mode: Rc::new(RefCell::new(Mode::Cleartext(SocketRw(fd)))),
            _owner: Rc::new(sock),
        })
    }

    /// Whether the stream is currently encrypted.
    pub fn is_ssl(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Ssl(..))
    }

    /// Performs the client side of a TLS handshake over the socket,
    /// presenting `domain` for SNI and certificate verification.
    ///
    /// On success, all future reads and writes go through the TLS session.
    ///
    /// Concurrent use of any other method during the handshake will panic.
    pub async fn ssl_connect(
        &self,
        domain: &str,
        connector: &openssl::ssl::SslConnector,
    ) -> io::Result<()> {
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mode = self.mode.borrow_mut();
        let result = connector.connect(domain, SocketRw(Rc::clone(&self.fd)));
        self.complete_ssl_handshake(mode, result).await
    }

    /// Performs the server side of a TLS handshake over the socket.
    ///
    /// Only the mock servers in the test suite ever accept connections.
    #[cfg(test)]
    pub async fn ssl_accept(
        &self,
        acceptor: &openssl::ssl::SslAcceptor,
    ) -> io::Result<()> {
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mode = self.mode.borrow_mut();
        let result = acceptor.accept(SocketRw(Rc::clone(&self.fd)));
        self.complete_ssl_handshake(mode, result).await
    }

    #[allow(clippy::await_holding_refcell_ref)] // intentional
    async fn complete_ssl_handshake(
        &self,
        mut mode: std::cell::RefMut<'_, Mode>,
        mut result: Result<
            SslStream<SocketRw>,
            openssl::ssl::HandshakeError<SocketRw>,
        >,
    ) -> io::Result<()> {
        // There is no way to ask tokio to wait for the FD to become ready
        // again after OpenSSL reports WANT_READ or WANT_WRITE. All we can do
        // is take the readiness guard (which may be stale), run another
        // handshake step, and clear the guard if OpenSSL still considers the
        // FD blocked.
        let mut read_guard: Option<AsyncFdReadyGuard<'_, RawFd>> = None;
        let mut write_guard: Option<AsyncFdReadyGuard<'_, RawFd>> = None;

        loop {
            match result {
                Ok(stream) => {
                    *mode = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(io::Error::new(io::ErrorKind::Other, e));
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_io_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }
                            read_guard = Some(self.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }
                            write_guard = Some(self.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_io_error(mhss)),
                    }
                },
            }
        }
    }

    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                // The first poll may be spurious if the last read stopped
                // short of draining the socket. Clear the readiness and poll
                // again so that tokio actually watches for changes.
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                // The FD somehow became ready between the two polls; have
                // the caller retry immediately.
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_write_ready(ctx))?.retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // An EOF inside the TLS session surfaces as a SYSCALL error with
            // no attached IO error, which into_io_error() fails to convert.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e.into_io_error().unwrap_or_else(
                |e| io::Error::new(io::ErrorKind::Other, e),
            ))),
        }
    }
}

fn mhss_to_io_error(
    mhss: openssl::ssl::MidHandshakeSslStream<SocketRw>,
) -> io::Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        return io::Error::new(io::ErrorKind::InvalidData, es.clone());
    }

    match e.into_io_error() {
        Ok(e) => e,
        Err(e) if openssl::ssl::ErrorCode::SYSCALL == e.code() => {
            io::ErrorKind::UnexpectedEof.into()
        },
        Err(e) => io::Error::new(io::ErrorKind::Other, e),
    }
}

impl AsyncRead for SessionIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut sock) => {
                Pin::new(sock).poll_read(ctx, buf)
            },

            Mode::Ssl(ref mut stream) => loop {
                match stream.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e)
                        if openssl::ssl::ErrorCode::ZERO_RETURN
                            == e.code() =>
                    {
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => {
                        futures::ready!(self.on_rw_ssl_error(ctx, e))?;
                    },
                }
            },
        }
    }
}

impl AsyncWrite for SessionIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        src: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut sock) => {
                Pin::new(sock).poll_write(ctx, src)
            },

            Mode::Ssl(ref mut stream) => loop {
                match stream.ssl_write(src) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => {
                        futures::ready!(self.on_rw_ssl_error(ctx, e))?;
                    },
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Neither the raw socket nor OpenSSL buffer writes.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut sock) => {
                Pin::new(sock).poll_shutdown(ctx)
            },

            Mode::Ssl(ref mut stream) => {
                match stream.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        task::Poll::Pending
                    },

                    Ok(openssl::ssl::ShutdownResult::Received) => {
                        // The TLS session is done; the stream reverts to
                        // cleartext.
                        *mode =
                            Mode::Cleartext(SocketRw(Rc::clone(&self.fd)));
                        task::Poll::Ready(Ok(()))
                    },

                    Err(e)
                        if openssl::ssl::ErrorCode::ZERO_RETURN
                            == e.code() =>
                    {
                        *mode =
                            Mode::Cleartext(SocketRw(Rc::clone(&self.fd)));
                        task::Poll::Ready(Ok(()))
                    },

                    Err(e) => {
                        futures::ready!(self.on_rw_ssl_error(ctx, e))?;
                        task::Poll::Pending
                    },
                }
            },
        }
    }
}

/// Adapts the raw socket to both the synchronous and the asynchronous
/// read/write traits, so that the same FD can sit underneath either OpenSSL
/// or tokio.
///
/// The synchronous operations do not block; they fail with `EWOULDBLOCK`,
/// which OpenSSL translates into `WANT_READ`/`WANT_WRITE` conditions that
/// the async layer above knows how to wait out.
struct SocketRw(Rc<AsyncFd<RawFd>>);

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for SocketRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;
            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },
                Ok(Err(e)) => return task::Poll::Ready(Err(e)),
                // Readiness was stale; wait for the real thing.
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        src: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;
            match guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), src).map_err(nix_to_io)
            }) {
                Ok(result) => return task::Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let _ = nix::sys::socket::shutdown(
            *self.0.get_ref(),
            nix::sys::socket::Shutdown::Write,
        );
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::test_data;

    #[tokio::main(flavor = "current_thread")]
    async fn run_cleartext_echo() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut a = SessionIo::new_owned_socket(a).unwrap();
        let mut b = SessionIo::new_owned_socket(b).unwrap();

        let write = async {
            a.write_all(b"hello world").await.unwrap();
            a.flush().await.unwrap();
        };
        let read = async {
            let mut buf = [0u8; 11];
            b.read_exact(&mut buf).await.unwrap();
            buf
        };

        let ((), buf) = tokio::join![write, read];
        assert_eq!(b"hello world", &buf);
    }

    #[test]
    fn cleartext_round_trip() {
        run_cleartext_echo();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_ssl_echo() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let mut client = SessionIo::new_owned_socket(client_sock).unwrap();
        let mut server = SessionIo::new_owned_socket(server_sock).unwrap();

        let mut connector_builder = openssl::ssl::SslConnector::builder(
            openssl::ssl::SslMethod::tls_client(),
        )
        .unwrap();
        connector_builder.set_verify(openssl::ssl::SslVerifyMode::NONE);
        let connector = connector_builder.build();

        let mut acceptor_builder =
            openssl::ssl::SslAcceptor::mozilla_intermediate_v5(
                openssl::ssl::SslMethod::tls_server(),
            )
            .unwrap();
        acceptor_builder
            .set_private_key(&test_data::CERTIFICATE_PRIVATE_KEY)
            .unwrap();
        acceptor_builder
            .set_certificate(&test_data::CERTIFICATE)
            .unwrap();
        let acceptor = acceptor_builder.build();

        let client_side = async {
            client.ssl_connect("localhost", &connector).await.unwrap();
            assert!(client.is_ssl());
            client.write_all(b"over tls").await.unwrap();
        };
        let server_side = async {
            server.ssl_accept(&acceptor).await.unwrap();
            let mut buf = [0u8; 8];
            server.read_exact(&mut buf).await.unwrap();
            buf
        };

        let ((), buf) = tokio::join![client_side, server_side];
        assert_eq!(b"over tls", &buf);
    }

    #[test]
    fn ssl_round_trip() {
        run_ssl_echo();
    }
}
