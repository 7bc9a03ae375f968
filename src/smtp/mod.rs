//! SMTP connection acceptance.
//!
//! [`SmtpServer`] owns a [`UrlEndpoint`] and a completion handler. It binds
//! every address the endpoint resolves to, spawns one protocol session per
//! accepted connection, and forwards each completed [`Envelope`] to the
//! handler. A misbehaving peer only ever takes down its own session.

pub mod command;
pub mod envelope;
pub mod protocol;

pub use envelope::{Encoding, EncodingError, Envelope};
pub use protocol::SmtpProtocol;

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::endpoint::{BoundEndpoint, EndpointError, UrlEndpoint};

/// Completion handler invoked once per fully assembled, validated envelope,
/// synchronously in the accepting session's task. Persistence and any
/// downstream notification happen behind this seam.
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

pub struct SmtpServer {
    endpoint: UrlEndpoint,
    handler: MessageHandler,
}

impl SmtpServer {
    /// The handler is a required argument: a capture server without one has
    /// nowhere to put the mail.
    pub fn new(endpoint: UrlEndpoint, handler: MessageHandler) -> Self {
        SmtpServer { endpoint, handler }
    }

    /// Binds a listener for every address the endpoint resolves to.
    pub async fn bind(&self) -> Result<Vec<BoundEndpoint>, EndpointError> {
        let mut bound = Vec::new();
        for instance in self.endpoint.enumerate().await? {
            let listener = instance.bind().await?;
            info!("SMTP server listening on {}", instance);
            bound.push(listener);
        }
        Ok(bound)
    }

    /// Accepts connections on the bound listeners until cancelled.
    pub async fn serve(&self, bound: Vec<BoundEndpoint>, cancel: CancellationToken) {
        let mut accept_loops = Vec::new();
        for listener in bound {
            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            accept_loops.push(tokio::spawn(accept_loop(listener, handler, cancel)));
        }
        for accept in accept_loops {
            accept.await.ok();
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), EndpointError> {
        let bound = self.bind().await?;
        self.serve(bound, cancel).await;
        Ok(())
    }
}

async fn accept_loop(bound: BoundEndpoint, handler: MessageHandler, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = bound.listener().accept() => match result {
                Ok((stream, peer)) => {
                    debug!("incoming connection from {peer}");
                    let handler = Arc::clone(&handler);
                    let tls = bound.tls_acceptor().cloned();
                    let hostname = bound.hostname().to_string();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve_connection(stream, hostname, handler).await,
                                Err(err) => Err(err),
                            },
                            None => serve_connection(stream, hostname, handler).await,
                        };
                        match result {
                            Ok(()) => debug!("connection from {peer} closed cleanly"),
                            Err(err) if is_disconnect(&err) => {
                                debug!("connection from {peer} closed: {err}")
                            }
                            Err(err) => error!("error on connection from {peer}: {err}"),
                        }
                    });
                }
                Err(err) => error!("error accepting connection: {err}"),
            },
            _ = cancel.cancelled() => {
                info!("SMTP listener shutting down");
                break;
            }
        }
    }
}

async fn serve_connection<S>(stream: S, hostname: String, handler: MessageHandler) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);
    let writer = BufWriter::new(write_half);
    let mut protocol = SmtpProtocol::new(reader, writer, hostname);
    protocol.run(|envelope| handler(envelope)).await
}

/// Whether a stream error means the peer disconnected without completing the
/// session or reading its whole response buffer. Those are a clean, if
/// early, end of session. Some platforms create sockets lazily and surface
/// the disconnect as a reset at first use.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(is_disconnect(&io::Error::new(kind, "peer went away")));
        }
        assert!(!is_disconnect(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "not a disconnect"
        )));
    }
}
