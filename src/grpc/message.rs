//! Length-prefixed gRPC message framing.
//!
//! Every message on the wire starts with a 5-byte prefix: one flag byte and a
//! big-endian `u32` length. Transport DATA boundaries do not follow message
//! boundaries, so [`MessageDecoder`] carries the bytes still owed for the
//! current message across calls.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::engine::{FLAG_FIN, FLAG_INIT};

pub const MESSAGE_PREFIX: usize = 5;

/// Flag byte of a gRPC-Web trailer frame.
pub const TRAILER_FLAG: u8 = 0x80;

const COMPRESSED_FLAG: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("unsupported message flag {0:#04x}")]
    UnsupportedFlag(u8),
    #[error("stream ended inside a message ({deferred} bytes owed)")]
    Truncated { deferred: u32 },
}

/// Write a message prefix.
pub fn encode_prefix(out: &mut BytesMut, flag: u8, length: u32) {
    out.put_u8(flag);
    out.put_u32(length);
}

/// One whole message with its prefix.
pub fn prefixed(flag: u8, message: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(MESSAGE_PREFIX + message.len());
    encode_prefix(&mut out, flag, message.len() as u32);
    out.extend_from_slice(message);
    out.freeze()
}

/// A slice of one message found in a transport chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// `FLAG_INIT` on the first slice of a message, `FLAG_FIN` on the last.
    pub flags: u8,
    pub payload: Bytes,
    /// Bytes of this message still to come after this slice.
    pub deferred: u32,
}

/// Restartable decoder for inbound message framing.
#[derive(Debug, Clone, Default)]
pub struct MessageDecoder {
    deferred: u32,
    prefix: [u8; MESSAGE_PREFIX],
    prefix_len: usize,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes still owed for the current message.
    pub fn deferred(&self) -> u32 {
        self.deferred
    }

    /// Whether the decoder sits exactly on a message boundary.
    pub fn at_boundary(&self) -> bool {
        self.deferred == 0 && self.prefix_len == 0
    }

    /// Check that the stream ended on a message boundary.
    pub fn finish(&self) -> Result<(), MessageError> {
        if self.at_boundary() {
            Ok(())
        } else {
            Err(MessageError::Truncated {
                deferred: self.deferred + (MESSAGE_PREFIX - self.prefix_len) as u32,
            })
        }
    }

    /// Split `chunk` into message fragments.
    ///
    /// A prefix cut short by the end of `chunk` is held until the next call;
    /// such a chunk may yield no fragments at all.
    pub fn decode(&mut self, chunk: &Bytes) -> Result<Vec<Fragment>, MessageError> {
        let mut fragments = Vec::new();
        let mut offset = 0;

        while offset < chunk.len() {
            if self.deferred > 0 {
                let take = (chunk.len() - offset).min(self.deferred as usize);
                self.deferred -= take as u32;
                let flags = if self.deferred == 0 { FLAG_FIN } else { 0 };
                fragments.push(Fragment {
                    flags,
                    payload: chunk.slice(offset..offset + take),
                    deferred: self.deferred,
                });
                offset += take;
                continue;
            }

            let needed = MESSAGE_PREFIX - self.prefix_len;
            let take = needed.min(chunk.len() - offset);
            self.prefix[self.prefix_len..self.prefix_len + take]
                .copy_from_slice(&chunk[offset..offset + take]);
            self.prefix_len += take;
            offset += take;
            if self.prefix_len < MESSAGE_PREFIX {
                break;
            }
            self.prefix_len = 0;

            let flag = self.prefix[0];
            if flag & !COMPRESSED_FLAG != 0 {
                return Err(MessageError::UnsupportedFlag(flag));
            }
            let length = u32::from_be_bytes([
                self.prefix[1],
                self.prefix[2],
                self.prefix[3],
                self.prefix[4],
            ]);
            let take = (chunk.len() - offset).min(length as usize);
            self.deferred = length - take as u32;
            let flags = if self.deferred == 0 {
                FLAG_INIT | FLAG_FIN
            } else {
                FLAG_INIT
            };
            fragments.push(Fragment {
                flags,
                payload: chunk.slice(offset..offset + take),
                deferred: self.deferred,
            });
            offset += take;
        }

        Ok(fragments)
    }
}
