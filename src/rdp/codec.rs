//! CLIPRDR frame codec
//!
//! Splits a byte stream into [`ClipboardPdu`]s and back.

use crate::clipboard::error::ClipboardError;
use crate::clipboard::pdu::ClipboardPdu;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Length-prefixed clipboard PDU framing
#[derive(Debug, Clone, Copy)]
pub struct CliprdrCodec {
    max_data_len: usize,
}

impl CliprdrCodec {
    /// Codec rejecting bodies larger than `max_data_len`
    pub fn new(max_data_len: usize) -> Self {
        Self { max_data_len }
    }
}

impl Decoder for CliprdrCodec {
    type Item = ClipboardPdu;
    type Error = ClipboardError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClipboardPdu>, ClipboardError> {
        loop {
            match ClipboardPdu::decode(src, self.max_data_len) {
                // Unknown frames are consumed by the decoder; skip to the next one
                Err(ClipboardError::UnknownMessageType(msg_type)) => {
                    warn!("Skipping clipboard PDU with unknown type {}", msg_type);
                }
                other => return other,
            }
        }
    }
}

impl Encoder<ClipboardPdu> for CliprdrCodec {
    type Error = ClipboardError;

    fn encode(&mut self, item: ClipboardPdu, dst: &mut BytesMut) -> Result<(), ClipboardError> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::pdu::MessageType;

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = CliprdrCodec::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(ClipboardPdu::new(MessageType::FormatDataRequest, 0, vec![13, 0, 0, 0]), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let pdu = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(pdu.msg_type, MessageType::FormatDataRequest);
        assert_eq!(&pdu.data[..], &[13, 0, 0, 0]);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_unknown_type_skipped() {
        let mut codec = CliprdrCodec::new(1024);
        let mut buf = BytesMut::from(&[0x42, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB][..]);
        codec
            .encode(ClipboardPdu::new(MessageType::MonitorReady, 0, Vec::new()), &mut buf)
            .unwrap();

        let pdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pdu.msg_type, MessageType::MonitorReady);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = CliprdrCodec::new(4);
        let mut buf = BytesMut::new();
        ClipboardPdu::new(MessageType::FormatDataResponse, 1, vec![0u8; 5])
            .encode(&mut buf)
            .unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ClipboardError::DataSizeExceeded { actual: 5, max: 4 })
        ));
    }
}
