//! ---
//! cosim_section: "02-messaging-rpc"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Message schema helpers and protocol codecs."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{RpcError, RpcMessage};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 10 * 1024 * 1024;

/// Length-prefixed JSON codec for [`RpcMessage`] frames.
#[derive(Debug)]
pub struct RpcCodec {
    length_codec: LengthDelimitedCodec,
}

impl RpcCodec {
    /// Codec with the default frame limit.
    pub fn new() -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = RpcMessage;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.length_codec.decode(src)? else {
            return Ok(None);
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(RpcError::Json)
    }
}

impl Encoder<RpcMessage> for RpcCodec {
    type Error = RpcError;

    fn encode(&mut self, item: RpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        self.length_codec
            .encode(Bytes::from(json), dst)
            .map_err(RpcError::Io)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::Call;

    #[test]
    fn frames_are_length_prefixed_json() {
        let mut buffer = BytesMut::new();
        let mut codec = RpcCodec::new();
        codec
            .encode(
                RpcMessage::Success {
                    id: 1,
                    result: json!(3),
                },
                &mut buffer,
            )
            .expect("encodes");

        assert_eq!(&buffer[..4], &[0, 0, 0, 7]);
        assert_eq!(&buffer[4..], b"[1,1,3]");
    }

    #[test]
    fn decodes_back_to_back_frames_and_waits_for_partial_ones() {
        let request = RpcMessage::Request {
            id: 1,
            call: Call::new("get_progress"),
        };
        let reply = RpcMessage::Success {
            id: 1,
            result: json!(42.0),
        };

        let mut buffer = BytesMut::new();
        let mut codec = RpcCodec::new();
        codec.encode(request.clone(), &mut buffer).unwrap();
        codec.encode(reply.clone(), &mut buffer).unwrap();

        let tail = buffer.split_off(buffer.len() - 2);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(request));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);

        buffer.unsplit(tail);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(reply));
    }

    #[test]
    fn rejects_non_json_payload() {
        let mut buffer = BytesMut::from(&[0u8, 0, 0, 3, b'a', b'b', b'c'][..]);
        let mut codec = RpcCodec::new();
        assert!(matches!(codec.decode(&mut buffer), Err(RpcError::Json(_))));
    }
}
