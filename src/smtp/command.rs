//! The SMTP command table.
//!
//! Commands are matched case-sensitively against the first space-delimited
//! token of a line; anything else is [`Command::Unknown`], which makes the
//! "command unrecognized" reply a total default case rather than a
//! fallthrough.

/// The closed set of commands the server dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Bdat,
    Rset,
    Noop,
    Quit,
    /// `SEND`, answered `502 Command not implemented`.
    Send,
    /// `SOML`, answered `502 Command not implemented`.
    Soml,
    /// `SAML`, answered `502 Command not implemented`.
    Saml,
    /// `EXPN`, answered `502 Command not implemented`.
    Expn,
    /// `VRFY`, answered `502 Command not implemented`.
    Vrfy,
    /// `HELP`, answered `502 Command not implemented`.
    Help,
    /// `STARTTLS`, answered `502 Command not implemented`.
    StartTls,
    Unknown,
}

impl Command {
    /// Maps a verb token to its command. Exact, case-sensitive match.
    pub fn parse(verb: &[u8]) -> Command {
        match verb {
            b"HELO" => Command::Helo,
            b"EHLO" => Command::Ehlo,
            b"MAIL" => Command::Mail,
            b"RCPT" => Command::Rcpt,
            b"DATA" => Command::Data,
            b"BDAT" => Command::Bdat,
            b"RSET" => Command::Rset,
            b"NOOP" => Command::Noop,
            b"QUIT" => Command::Quit,
            b"SEND" => Command::Send,
            b"SOML" => Command::Soml,
            b"SAML" => Command::Saml,
            b"EXPN" => Command::Expn,
            b"VRFY" => Command::Vrfy,
            b"HELP" => Command::Help,
            b"STARTTLS" => Command::StartTls,
            _ => Command::Unknown,
        }
    }

    /// Whether this command is deliberately left unimplemented.
    pub fn is_stub(self) -> bool {
        matches!(
            self,
            Command::Send
                | Command::Soml
                | Command::Saml
                | Command::Expn
                | Command::Vrfy
                | Command::Help
                | Command::StartTls
        )
    }
}

/// Splits at the first occurrence of `delim`, like the two-way split the
/// line grammar uses throughout: `"MAIL FROM:<a> X"` on a space gives
/// `(b"MAIL", Some(b"FROM:<a> X"))`, while an absent delimiter gives the
/// whole input and `None`.
pub fn split_first(input: &[u8], delim: u8) -> (&[u8], Option<&[u8]>) {
    match input.iter().position(|b| *b == delim) {
        Some(at) => (&input[..at], Some(&input[at + 1..])),
        None => (input, None),
    }
}
