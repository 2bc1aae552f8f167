//! Message framing and the one-byte acknowledgment protocol.

use crate::config::Framing;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Positive acknowledgment.
pub const ACK: u8 = 0x06;
/// Negative acknowledgment.
pub const NACK: u8 = 0x15;

/// MLLP start-of-block.
pub const START_BLOCK: u8 = 0x0B;
/// MLLP end-of-block.
pub const END_BLOCK: u8 = 0x1C;
/// MLLP trailer after end-of-block.
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Splits inbound bytes into messages and writes acknowledgment bytes.
#[derive(Debug)]
pub struct MessageCodec {
    framing: Framing,
    max_message_bytes: usize,
}

impl MessageCodec {
    pub fn new(framing: Framing, max_message_bytes: usize) -> Self {
        Self {
            framing,
            max_message_bytes,
        }
    }

    fn decode_mllp(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        let Some(start) = src.iter().position(|&b| b == START_BLOCK) else {
            if src.iter().any(|b| !b.is_ascii_whitespace()) {
                tracing::warn!("discarding {} byte(s) outside an MLLP block", src.len());
            }
            src.clear();
            return Ok(None);
        };
        if start > 0 {
            if src[..start].iter().any(|b| !b.is_ascii_whitespace()) {
                tracing::warn!("discarding {} byte(s) before MLLP start block", start);
            }
            src.advance(start);
        }

        let Some(end) = src.iter().position(|&b| b == END_BLOCK) else {
            if src.len() > self.max_message_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "MLLP message exceeds {} bytes without an end block",
                        self.max_message_bytes
                    ),
                ));
            }
            return Ok(None);
        };

        let mut block = src.split_to(end + 1);
        if src.first() == Some(&CARRIAGE_RETURN) {
            src.advance(1);
        }
        // Drop the start and end block bytes.
        block.advance(1);
        block.truncate(block.len() - 1);
        Ok(Some(block))
    }
}

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::PerRead if src.is_empty() => Ok(None),
            Framing::PerRead => Ok(Some(src.split())),
            Framing::Mllp => self.decode_mllp(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                if !src.is_empty() {
                    tracing::warn!(
                        "connection closed with {} byte(s) of an unfinished message",
                        src.len()
                    );
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<u8> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: u8, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item);
        Ok(())
    }
}
