//! The in-memory record of one message in transit.
//!
//! An [`Envelope`] is created by `MAIL`, grows through `RCPT` and either a
//! `DATA` session or a series of `BDAT` chunks, and is finalized against its
//! declared content encoding before being handed to the completion handler.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Content encoding declared for a message, from `MAIL` parameters.
///
/// `BODY=7BIT` maps to [`Encoding::Ascii`], `BODY=8BITMIME` to
/// [`Encoding::Binary`], `SMTPUTF8` to [`Encoding::Utf8`]. Messages that
/// declare nothing default to UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Strict 7-bit US-ASCII.
    Ascii,
    /// Raw bytes, no validation.
    Binary,
    /// Strict UTF-8.
    Utf8,
}

/// Content bytes that do not match the declared encoding.
///
/// The display text becomes the detail of the `500 Bad encoding:` response.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("invalid 7-bit ASCII byte 0x{byte:02x} at offset {offset}")]
    NotAscii { byte: u8, offset: usize },
    #[error("invalid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// Sender, recipients, encoding and raw content of one message.
#[derive(Debug)]
pub struct Envelope {
    sender: String,
    recipients: Vec<String>,
    encoding: Encoding,
    content: BytesMut,
}

impl Envelope {
    pub fn new(sender: String) -> Self {
        Envelope {
            sender,
            recipients: Vec::new(),
            encoding: Encoding::Utf8,
            content: BytesMut::new(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Recipients in arrival order, duplicates preserved.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub fn add_recipient(&mut self, recipient: String) {
        self.recipients.push(recipient);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.content.extend_from_slice(bytes);
    }

    /// Appends one unstuffed `DATA` line, restoring its CRLF terminator.
    pub fn append_line(&mut self, line: &[u8]) {
        self.content.extend_from_slice(line);
        self.content.extend_from_slice(b"\r\n");
    }

    pub fn content_is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Validates the accumulated content against the declared encoding.
    ///
    /// Consumes the envelope either way: a failed message is discarded, a
    /// validated one is immutable from here on.
    pub fn finalize(self) -> Result<Envelope, EncodingError> {
        match self.encoding {
            Encoding::Binary => {}
            Encoding::Utf8 => {
                std::str::from_utf8(&self.content)?;
            }
            Encoding::Ascii => {
                if let Some((offset, byte)) = self
                    .content
                    .iter()
                    .enumerate()
                    .find(|(_, b)| !b.is_ascii())
                {
                    return Err(EncodingError::NotAscii {
                        byte: *byte,
                        offset,
                    });
                }
            }
        }
        Ok(self)
    }

    /// Content as text. `None` for binary messages.
    ///
    /// Only meaningful after [`finalize`](Self::finalize); before that the
    /// buffer may not yet be valid for its declared encoding.
    pub fn text(&self) -> Option<&str> {
        match self.encoding {
            Encoding::Binary => None,
            Encoding::Ascii | Encoding::Utf8 => std::str::from_utf8(&self.content).ok(),
        }
    }

    /// Hands off the raw content, freezing the buffer.
    pub fn into_content(self) -> Bytes {
        self.content.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_utf8_with_no_recipients() {
        let envelope = Envelope::new("<a@b>".to_string());
        assert_eq!(envelope.sender(), "<a@b>");
        assert_eq!(envelope.encoding(), Encoding::Utf8);
        assert!(envelope.recipients().is_empty());
        assert!(envelope.content_is_empty());
    }

    #[test]
    fn recipients_keep_order_and_duplicates() {
        let mut envelope = Envelope::new("<a@b>".to_string());
        envelope.add_recipient("<c@d>".to_string());
        envelope.add_recipient("<e@f>".to_string());
        envelope.add_recipient("<c@d>".to_string());
        assert_eq!(envelope.recipients(), ["<c@d>", "<e@f>", "<c@d>"]);
    }

    #[test]
    fn append_line_restores_crlf() {
        let mut envelope = Envelope::new("<a@b>".to_string());
        envelope.append_line(b"Hello");
        envelope.append_line(b"");
        assert_eq!(envelope.content(), b"Hello\r\n\r\n");
    }

    #[test]
    fn finalize_ascii_rejects_high_bytes() {
        let mut envelope = Envelope::new("<a@b>".to_string());
        envelope.set_encoding(Encoding::Ascii);
        envelope.append(b"ok so far \xc3\xa9");
        let err = envelope.finalize().unwrap_err();
        assert!(matches!(err, EncodingError::NotAscii { byte: 0xc3, offset: 10 }));
    }

    #[test]
    fn finalize_utf8_rejects_invalid_sequences() {
        let mut envelope = Envelope::new("<a@b>".to_string());
        envelope.append(b"\xff\xfe");
        assert!(matches!(
            envelope.finalize(),
            Err(EncodingError::NotUtf8(_))
        ));
    }

    #[test]
    fn finalize_binary_accepts_anything() {
        let mut envelope = Envelope::new("<a@b>".to_string());
        envelope.set_encoding(Encoding::Binary);
        envelope.append(&[0x00, 0xff, 0x80]);
        let envelope = envelope.finalize().unwrap();
        assert_eq!(envelope.content(), [0x00, 0xff, 0x80]);
        assert_eq!(envelope.text(), None);
    }

    #[test]
    fn text_exposes_validated_content() {
        let mut envelope = Envelope::new("<a@b>".to_string());
        envelope.append("héllo".as_bytes());
        let envelope = envelope.finalize().unwrap();
        assert_eq!(envelope.text(), Some("héllo"));
        assert_eq!(&envelope.into_content()[..], "héllo".as_bytes());
    }
}
