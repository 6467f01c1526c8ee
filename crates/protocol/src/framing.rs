//! Frame codec for the length-prefixed daemon protocol.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1 byte: frame type
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! Frames with no payload carry a length of zero. Payloads are capped at
//! 1 MiB; a frame declaring more is rejected before any allocation.

use crate::error::ProtocolError;
use crate::messages::Message;
use crate::Result;

/// Maximum payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Frame header size: 1 (type) + 4 (length) = 5 bytes.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Encoder and decoder for frames.
///
/// The codec is stateless; buffering across reads is the caller's concern
/// (see the daemon's connection reader, which accumulates socket bytes and
/// calls [`FrameCodec::try_decode`] until it returns `None`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a message into bytes.
    ///
    /// Encoding is total: every [`Message`] this crate can represent has a
    /// valid wire form.
    pub fn encode(&self, msg: &Message) -> Vec<u8> {
        let payload = msg.encode_payload();
        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.push(msg.frame_type());
        output.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        output.extend_from_slice(&payload);
        output
    }

    /// Try to decode one message from the front of `data`.
    ///
    /// Returns `Ok(None)` if `data` does not yet contain a complete frame,
    /// or `Ok(Some((message, consumed)))` on success. Oversized and unknown
    /// frames are reported as errors as soon as the header is available.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Message, usize)>> {
        match self.try_split(data)? {
            Some((frame_type, payload, consumed)) => {
                let msg = Message::decode(frame_type, payload)?;
                Ok(Some((msg, consumed)))
            }
            None => Ok(None),
        }
    }

    /// Decode one message, treating incomplete data as an error.
    ///
    /// This is [`FrameCodec::try_decode`] with `None` mapped to
    /// [`ProtocolError::ShortRead`]; the daemon uses it when a peer closes
    /// the socket with a partial frame still buffered.
    pub fn decode(&self, data: &[u8]) -> Result<(Message, usize)> {
        self.try_decode(data)?.ok_or(ProtocolError::ShortRead)
    }

    /// Split a raw frame off the front of `data` without interpreting the
    /// payload.
    ///
    /// Returns the type byte, the payload slice, and the number of bytes
    /// consumed. Clients that want to skip unknown server-to-client frame
    /// types can use this directly and only call [`Message::decode`] for
    /// types they recognize.
    pub fn try_split<'a>(&self, data: &'a [u8]) -> Result<Option<(u8, &'a [u8], usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = data[0];
        let length_bytes: [u8; 4] = data[1..5].try_into().expect("sliced exactly 4 bytes");
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if data.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        let payload = &data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length];
        Ok(Some((frame_type, payload, FRAME_HEADER_SIZE + length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::wire;

    #[test]
    fn test_encode_header_format() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Message::Data(vec![0xDE, 0xAD, 0xBE, 0xEF]));

        assert_eq!(encoded[0], wire::DATA);
        let length = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(length, 4);
        assert_eq!(&encoded[5..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_empty_payload_has_zero_length() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Message::Exit);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        assert_eq!(&encoded[1..5], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_roundtrip_data() {
        let codec = FrameCodec::new();
        let msg = Message::Data(b"hello world".to_vec());
        let encoded = codec.encode(&msg);
        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_try_decode_partial_data() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Message::Data(vec![1, 2, 3, 4, 5]));

        for i in 0..encoded.len() {
            let result = codec.try_decode(&encoded[..i]).unwrap();
            assert!(result.is_none(), "partial data of {i} bytes should decode to None");
        }

        let (decoded, consumed) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, Message::Data(vec![1, 2, 3, 4, 5]));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_short_read() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Message::Data(vec![1, 2, 3]));
        let result = codec.decode(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::ShortRead)));
    }

    #[test]
    fn test_max_payload_accepted() {
        let codec = FrameCodec::new();
        let msg = Message::Data(vec![0u8; MAX_PAYLOAD_SIZE]);
        let encoded = codec.encode(&msg);
        let (decoded, _) = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let codec = FrameCodec::new();
        // Hand-build a header claiming 1 MiB + 1; no payload needed, the
        // length check fires before the payload is read.
        let mut data = vec![wire::DATA];
        data.extend_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());

        let result = codec.try_decode(&data);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, max })
                if size == MAX_PAYLOAD_SIZE + 1 && max == MAX_PAYLOAD_SIZE
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let codec = FrameCodec::new();
        let data = [0x7F, 0, 0, 0, 0];
        let result = codec.try_decode(&data);
        assert!(matches!(result, Err(ProtocolError::UnknownType(0x7F))));
    }

    #[test]
    fn test_try_split_allows_skipping_unknown_types() {
        let codec = FrameCodec::new();
        let mut data = vec![0x7F];
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[9, 9, 9]);
        // Append a frame the client does understand.
        data.extend_from_slice(&codec.encode(&Message::Exit));

        let (frame_type, payload, consumed) = codec.try_split(&data).unwrap().unwrap();
        assert_eq!(frame_type, 0x7F);
        assert_eq!(payload, &[9, 9, 9]);

        let (msg, _) = codec.try_decode(&data[consumed..]).unwrap().unwrap();
        assert_eq!(msg, Message::Exit);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let codec = FrameCodec::new();
        let first = codec.encode(&Message::Data(vec![1, 2, 3]));
        let second = codec.encode(&Message::List);

        let mut combined = first.clone();
        combined.extend_from_slice(&second);

        let (msg1, consumed1) = codec.decode(&combined).unwrap();
        assert_eq!(msg1, Message::Data(vec![1, 2, 3]));
        assert_eq!(consumed1, first.len());

        let (msg2, consumed2) = codec.decode(&combined[consumed1..]).unwrap();
        assert_eq!(msg2, Message::List);
        assert_eq!(consumed2, second.len());
    }
}
