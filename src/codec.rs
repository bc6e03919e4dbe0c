//! Newline-delimited framing for action envelopes
//!
//! Each record is one encoded envelope followed by `\n`. The envelope is
//! byte-stuffed first so a raw `0x0A` can never appear inside a record:
//!
//! | raw byte | on the wire   |
//! |----------|---------------|
//! | `0x0A`   | `0x7D 0x2A`   |
//! | `0x7D`   | `0x7D 0x5D`   |

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::message::{decode_action, encode_action, Action};

/// Record delimiter
pub const FRAME_DELIMITER: u8 = b'\n';

const ESCAPE: u8 = 0x7D;
const ESCAPE_MASK: u8 = 0x20;

/// Default upper bound on one stuffed record, delimiter excluded
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Byte-stuff `raw` into `dst`
pub fn escape_into(raw: &[u8], dst: &mut BytesMut) {
    dst.reserve(raw.len());
    for &byte in raw {
        if byte == FRAME_DELIMITER || byte == ESCAPE {
            dst.put_u8(ESCAPE);
            dst.put_u8(byte ^ ESCAPE_MASK);
        } else {
            dst.put_u8(byte);
        }
    }
}

/// Reverse `escape_into`
pub fn unescape(stuffed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut raw = Vec::with_capacity(stuffed.len());
    let mut bytes = stuffed.iter().copied().enumerate();
    while let Some((index, byte)) = bytes.next() {
        if byte != ESCAPE {
            raw.push(byte);
            continue;
        }
        match bytes.next() {
            Some((_, escaped)) if escaped ^ ESCAPE_MASK == FRAME_DELIMITER => raw.push(FRAME_DELIMITER),
            Some((_, escaped)) if escaped ^ ESCAPE_MASK == ESCAPE => raw.push(ESCAPE),
            _ => return Err(CodecError::InvalidEscape(index)),
        }
    }
    Ok(raw)
}

/// Tokio codec turning a byte stream into `Action`s and back
#[derive(Debug, Clone)]
pub struct ActionCodec {
    max_frame_length: usize,
    /// Bytes already scanned for a delimiter
    next_index: usize,
}

impl ActionCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            next_index: 0,
        }
    }
}

impl Default for ActionCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for ActionCodec {
    type Item = Action;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Action>, CodecError> {
        let Some(offset) = src[self.next_index..]
            .iter()
            .position(|b| *b == FRAME_DELIMITER)
        else {
            self.next_index = src.len();
            if src.len() > self.max_frame_length {
                return Err(CodecError::FrameTooLong {
                    len: src.len(),
                    max: self.max_frame_length,
                });
            }
            return Ok(None);
        };

        let end = self.next_index + offset;
        self.next_index = 0;
        if end > self.max_frame_length {
            return Err(CodecError::FrameTooLong {
                len: end,
                max: self.max_frame_length,
            });
        }

        let record = src.split_to(end + 1);
        let raw = unescape(&record[..end])?;
        let (action, _rest) = decode_action(&raw)?;
        Ok(Some(action))
    }
}

impl Encoder<Action> for ActionCodec {
    type Error = CodecError;

    fn encode(&mut self, action: Action, dst: &mut BytesMut) -> Result<(), CodecError> {
        let envelope = encode_action(action.kind, &action.payload)?;
        let start = dst.len();
        escape_into(&envelope, dst);

        // Same bound the peer's decoder applies, delimiter excluded
        let len = dst.len() - start;
        if len > self.max_frame_length {
            dst.truncate(start);
            return Err(CodecError::FrameTooLong {
                len,
                max: self.max_frame_length,
            });
        }

        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ActionKind;

    fn encode(action: Action) -> BytesMut {
        let mut buf = BytesMut::new();
        ActionCodec::default().encode(action, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_escape_round_trip() {
        let raw = [0x0A, 0x7D, 0x00, 0x2A, 0x5D, 0x0A];
        let mut stuffed = BytesMut::new();
        escape_into(&raw, &mut stuffed);

        assert!(!stuffed.contains(&FRAME_DELIMITER));
        assert_eq!(unescape(&stuffed).unwrap(), raw);
    }

    #[test]
    fn test_invalid_escape() {
        assert!(matches!(unescape(&[1, ESCAPE, 0x00]), Err(CodecError::InvalidEscape(1))));
        assert!(matches!(unescape(&[ESCAPE]), Err(CodecError::InvalidEscape(0))));
    }

    #[test]
    fn test_only_delimiter_is_the_terminator() {
        // Payload length 10 puts a 0x0A into the length prefix as well
        let action = Action::new(ActionKind::Message, b"ten\nbytes\n".to_vec());
        let buf = encode(action);

        let newlines = buf.iter().filter(|b| **b == FRAME_DELIMITER).count();
        assert_eq!(newlines, 1);
        assert_eq!(buf.last(), Some(&FRAME_DELIMITER));
    }

    #[test]
    fn test_decode_round_trip_with_partial_input() {
        let first = Action::new(ActionKind::Message, b"hi\n".to_vec());
        let second = Action::empty(ActionKind::GetUsers);

        let mut wire = encode(first.clone());
        wire.extend_from_slice(&encode(second.clone()));

        let mut codec = ActionCodec::default();
        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            while let Some(action) = codec.decode(&mut src).unwrap() {
                decoded.push(action);
            }
        }

        assert_eq!(decoded, vec![first, second]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_frame_too_long() {
        let mut codec = ActionCodec::new(8);
        let mut src = BytesMut::from(&[0u8; 16][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(CodecError::FrameTooLong { len: 16, max: 8 })
        ));
    }

    #[test]
    fn test_encoder_applies_the_decoder_limit() {
        let action = Action::new(ActionKind::Message, vec![0x41; 32]);
        let record_len = encode(action.clone()).len() - 1;

        // Exactly at the limit: encodes, and a decoder with the same limit accepts it
        let mut at_limit = ActionCodec::new(record_len);
        let mut buf = BytesMut::new();
        at_limit.encode(action.clone(), &mut buf).unwrap();
        assert_eq!(at_limit.decode(&mut buf).unwrap(), Some(action.clone()));

        // One byte over: rejected without leaving a partial record behind
        let mut over_limit = ActionCodec::new(record_len - 1);
        let mut buf = BytesMut::from(&b"kept"[..]);
        assert!(matches!(
            over_limit.encode(action, &mut buf),
            Err(CodecError::FrameTooLong { len, max }) if len == record_len && max == record_len - 1
        ));
        assert_eq!(&buf[..], b"kept");
    }

    #[test]
    fn test_empty_record_is_malformed() {
        let mut codec = ActionCodec::default();
        let mut src = BytesMut::from(&b"\n"[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }
}
