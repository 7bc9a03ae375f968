//! The SMTP protocol state machine for one accepted connection.
//!
//! [`SmtpProtocol`] reads CRLF-terminated lines, dispatches them through the
//! closed [`Command`] table, drives the [`Envelope`] slot through its
//! lifecycle, and yields every completed envelope to the caller-supplied
//! handler. Content arrives either through the classic `DATA` line
//! sub-protocol (with dot-unstuffing) or through binary `BDAT` chunks.
//!
//! It is generic over the reader (`R`) and writer (`W`) so tests can drive a
//! whole session from an in-memory script.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::smtp::command::{split_first, Command};
use crate::smtp::envelope::{Encoding, Envelope};

const GREETING: &str = "Mailcatch ready";
const UNRECOGNIZED: &str = "Syntax error, command unrecognized";
const BAD_PARAMETERS: &str = "Syntax error in parameters or arguments";
const BAD_SEQUENCE: &str = "Bad sequence of commands";
const NOT_IMPLEMENTED: &str = "Command not implemented";

/// Per-connection protocol driver.
///
/// Owns the line I/O and the envelope slot. The slot is `None` while no
/// message is in transit; `MAIL` fills it (replacing any prior one), `RSET`
/// and every handoff clear it.
pub struct SmtpProtocol<R, W> {
    reader: R,
    writer: W,
    hostname: String,
    envelope: Option<Envelope>,
}

impl<R, W> SmtpProtocol<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, hostname: impl Into<String>) -> Self {
        SmtpProtocol {
            reader,
            writer,
            hostname: hostname.into(),
            envelope: None,
        }
    }

    /// Runs the session to completion.
    ///
    /// `on_message` is invoked synchronously, once per fully assembled and
    /// validated envelope, before the final `250 OK` is written. Returns on
    /// `QUIT` or end-of-stream; a partial envelope is never emitted. Control
    /// is yielded back to the scheduler after every processed line so that
    /// concurrent sessions make progress even on a single-threaded runtime.
    pub async fn run<F>(&mut self, mut on_message: F) -> io::Result<()>
    where
        F: FnMut(Envelope),
    {
        self.write_response(220, &[GREETING]).await?;

        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(());
            };
            let (verb, tail) = split_first(&line, b' ');

            match Command::parse(verb) {
                Command::Helo => {
                    let hostname = self.hostname.clone();
                    self.write_response(250, &[&hostname]).await?;
                }
                Command::Ehlo => {
                    let hostname = self.hostname.clone();
                    self.write_response(250, &[&hostname, "8BITMIME", "SMTPUTF8", "CHUNKING"])
                        .await?;
                }
                Command::Mail => {
                    let (from, rest) = match tail {
                        Some(tail) => split_first(tail, b':'),
                        None => {
                            self.write_response(500, &[UNRECOGNIZED]).await?;
                            continue;
                        }
                    };
                    let rest = match rest {
                        Some(rest) if from == b"FROM" => rest,
                        _ => {
                            self.write_response(500, &[UNRECOGNIZED]).await?;
                            continue;
                        }
                    };
                    let (sender, params) = split_first(rest, b' ');
                    let sender = String::from_utf8_lossy(sender).into_owned();
                    // A new envelope replaces whatever was in the slot.
                    let mut envelope = Envelope::new(sender.clone());
                    if let Some(params) = params {
                        for param in params.split(|b| *b == b' ') {
                            match param {
                                b"" => {}
                                b"BODY=7BIT" => envelope.set_encoding(Encoding::Ascii),
                                b"BODY=8BITMIME" => envelope.set_encoding(Encoding::Binary),
                                b"SMTPUTF8" => envelope.set_encoding(Encoding::Utf8),
                                // Unknown parameters are answered individually
                                // but do not abort the command.
                                _ => self.write_response(501, &[BAD_PARAMETERS]).await?,
                            }
                        }
                    }
                    self.envelope = Some(envelope);
                    self.write_response(250, &[&format!("New message from: {sender}")])
                        .await?;
                }
                Command::Rcpt => {
                    if self.envelope.is_none() {
                        self.write_response(503, &[BAD_SEQUENCE]).await?;
                        continue;
                    }
                    let (to, rest) = match tail {
                        Some(tail) => split_first(tail, b':'),
                        None => {
                            self.write_response(501, &[BAD_PARAMETERS]).await?;
                            continue;
                        }
                    };
                    let rest = match rest {
                        Some(rest) if to == b"TO" => rest,
                        _ => {
                            self.write_response(501, &[BAD_PARAMETERS]).await?;
                            continue;
                        }
                    };
                    let (recipient, extra) = split_first(rest, b' ');
                    if extra.is_some_and(|extra| !extra.is_empty()) {
                        self.write_response(501, &[BAD_PARAMETERS]).await?;
                        continue;
                    }
                    let recipient = String::from_utf8_lossy(recipient).into_owned();
                    if let Some(envelope) = self.envelope.as_mut() {
                        envelope.add_recipient(recipient.clone());
                    }
                    self.write_response(250, &[&format!("Recipient added: {recipient}")])
                        .await?;
                }
                Command::Data => {
                    match &self.envelope {
                        None => {
                            self.write_response(503, &[BAD_SEQUENCE]).await?;
                            continue;
                        }
                        // Content already present means BDAT was used; the
                        // two transfer modes do not mix.
                        Some(envelope) if !envelope.content_is_empty() => {
                            self.write_response(503, &[BAD_SEQUENCE]).await?;
                            continue;
                        }
                        Some(_) => {}
                    }
                    if tail.is_some_and(|tail| !tail.is_empty()) {
                        self.write_response(501, &[BAD_PARAMETERS]).await?;
                        continue;
                    }
                    self.write_response(354, &["Start mail input; end with <CRLF>.<CRLF>"])
                        .await?;
                    loop {
                        let Some(line) = self.read_line().await? else {
                            // Peer vanished mid-message: nothing is emitted.
                            return Ok(());
                        };
                        if line == b"." {
                            break;
                        }
                        let unstuffed = if line.first() == Some(&b'.') {
                            &line[1..]
                        } else {
                            &line[..]
                        };
                        if let Some(envelope) = self.envelope.as_mut() {
                            envelope.append_line(unstuffed);
                        }
                        tokio::task::yield_now().await;
                    }
                    let Some(envelope) = self.envelope.take() else {
                        continue;
                    };
                    if self.emit(envelope, &mut on_message).await? {
                        self.write_response(250, &["OK"]).await?;
                    } else {
                        continue;
                    }
                }
                Command::Bdat => {
                    if self.envelope.is_none() {
                        self.write_response(503, &[BAD_SEQUENCE]).await?;
                        continue;
                    }
                    let Some(tail) = tail else {
                        self.write_response(501, &[BAD_PARAMETERS]).await?;
                        continue;
                    };
                    let (size, rest) = split_first(tail, b' ');
                    // Only a canonical integer literal is a valid size:
                    // "007", "+5" and "5x" are all syntax errors.
                    let size = match std::str::from_utf8(size)
                        .ok()
                        .and_then(|token| {
                            token.parse::<usize>().ok().filter(|n| n.to_string() == token)
                        }) {
                        Some(size) => size,
                        None => {
                            self.write_response(501, &[BAD_PARAMETERS]).await?;
                            continue;
                        }
                    };
                    let last = match rest {
                        Some(b"LAST") => true,
                        Some(rest) if !rest.is_empty() => {
                            self.write_response(501, &[BAD_PARAMETERS]).await?;
                            continue;
                        }
                        _ => false,
                    };
                    let mut chunk = vec![0u8; size];
                    self.reader.read_exact(&mut chunk).await?;
                    if let Some(envelope) = self.envelope.as_mut() {
                        envelope.append(&chunk);
                    }
                    if last {
                        let Some(envelope) = self.envelope.take() else {
                            continue;
                        };
                        if !self.emit(envelope, &mut on_message).await? {
                            continue;
                        }
                    }
                    self.write_response(250, &["OK"]).await?;
                }
                Command::Rset => {
                    if tail.is_some_and(|tail| !tail.is_empty()) {
                        self.write_response(501, &[BAD_PARAMETERS]).await?;
                        continue;
                    }
                    self.envelope = None;
                    self.write_response(250, &["OK"]).await?;
                }
                Command::Noop => {
                    if tail.is_some_and(|tail| !tail.is_empty()) {
                        self.write_response(501, &[BAD_PARAMETERS]).await?;
                        continue;
                    }
                    self.write_response(250, &["OK"]).await?;
                }
                Command::Quit => {
                    if tail.is_some_and(|tail| !tail.is_empty()) {
                        self.write_response(501, &[BAD_PARAMETERS]).await?;
                        continue;
                    }
                    self.write_response(221, &["Bye!"]).await?;
                    self.writer.shutdown().await.ok();
                    return Ok(());
                }
                Command::Send
                | Command::Soml
                | Command::Saml
                | Command::Expn
                | Command::Vrfy
                | Command::Help
                | Command::StartTls => {
                    self.write_response(502, &[NOT_IMPLEMENTED]).await?;
                }
                Command::Unknown => {
                    self.write_response(500, &[UNRECOGNIZED]).await?;
                }
            }

            tokio::task::yield_now().await;
        }
    }

    /// Finalizes an envelope and hands it to the caller.
    ///
    /// Returns `false` when the content does not match its declared encoding;
    /// the `500` has then already been written and the message is gone.
    async fn emit<F>(&mut self, envelope: Envelope, on_message: &mut F) -> io::Result<bool>
    where
        F: FnMut(Envelope),
    {
        match envelope.finalize() {
            Ok(envelope) => {
                on_message(envelope);
                Ok(true)
            }
            Err(err) => {
                self.write_response(500, &[&format!("Bad encoding: {err}")])
                    .await?;
                Ok(false)
            }
        }
    }

    /// Reads one line, excluding its CRLF terminator, as raw bytes.
    ///
    /// Bytes, not text: 8BITMIME message content is not required to be valid
    /// UTF-8. `None` means end-of-stream.
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        trace!("smtp read: {:?}", String::from_utf8_lossy(&line));
        Ok(Some(line))
    }

    /// Writes a numeric-coded response, multi-line capable.
    ///
    /// All but the last line use `"<code>-<text>"`; the last uses
    /// `"<code> <text>"`.
    async fn write_response(&mut self, code: u16, lines: &[&str]) -> io::Result<()> {
        if let Some((last, rest)) = lines.split_last() {
            let mut response = String::new();
            for line in rest {
                response.push_str(&format!("{code}-{line}\r\n"));
            }
            response.push_str(&format!("{code} {last}\r\n"));
            trace!("smtp write: {:?}", response);
            self.writer.write_all(response.as_bytes()).await?;
            self.writer.flush().await?;
        }
        Ok(())
    }
}
