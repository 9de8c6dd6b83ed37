//! CLIPRDR Packet Codec
//!
//! Encoders and decoders for the clipboard virtual channel messages the
//! bridge exchanges with the remote session (MS-RDPECLIP).
//!
//! # Wire layouts (all integers little-endian)
//!
//! ```text
//! PDU header (8 bytes)
//!   0  msgType   u16
//!   2  msgFlags  u16
//!   4  dataLen   u32
//!
//! Format list record (36 bytes, repeated)
//!   0  formatId    u32
//!   4  formatName  [u8; 32]   (zero-filled on output)
//!
//! Format data request (4 bytes)
//!   0  requestedFormatId u32
//!
//! Capabilities (16 bytes on output)
//!   0  cCapabilitiesSets  u16 = 1
//!   2  pad1               u16 = 0
//!   4  capabilitySetType  u16 = 1 (CB_CAPSTYPE_GENERAL)
//!   6  lengthCapability   u16 = 12
//!   8  version            u32 = 2
//!  12  generalFlags       u32 = 0
//! ```

use crate::clipboard::error::{ClipboardError, ClipboardResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the common PDU header
pub const PDU_HEADER_SIZE: usize = 8;

/// Size of one short-format-name record in a format list
pub const FORMAT_RECORD_SIZE: usize = 36;

/// Size of the name field inside a format list record
pub const FORMAT_NAME_SIZE: usize = 32;

/// Size of the capability block the bridge emits
pub const CAPABILITIES_SIZE: usize = 16;

/// General capability set type
pub const CB_CAPSTYPE_GENERAL: u16 = 1;

/// Length of the general capability set
pub const GENERAL_CAPABILITY_LENGTH: u16 = 12;

/// Clipboard protocol version advertised in the general capability set
pub const CB_CAPS_VERSION_2: u32 = 2;

/// `msgFlags` values
pub mod msg_flags {
    /// Request succeeded
    pub const CB_RESPONSE_OK: u16 = 0x0001;
    /// Request failed
    pub const CB_RESPONSE_FAIL: u16 = 0x0002;
    /// Format names in the format list are ASCII, not UTF-16LE
    pub const CB_ASCII_NAMES: u16 = 0x0004;
}

use msg_flags::*;

// =============================================================================
// Message Types
// =============================================================================

/// CLIPRDR message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Server is ready for clipboard traffic
    MonitorReady = 0x0001,
    /// Format list announcement
    FormatList = 0x0002,
    /// Acknowledgement of a format list
    FormatListResponse = 0x0003,
    /// Request for clipboard data in a given format
    FormatDataRequest = 0x0004,
    /// Clipboard data (or failure)
    FormatDataResponse = 0x0005,
    /// Client temporary directory
    TemporaryDirectory = 0x0006,
    /// Capability exchange
    ClipCaps = 0x0007,
    /// File contents request
    FileContentsRequest = 0x0008,
    /// File contents response
    FileContentsResponse = 0x0009,
    /// Lock clipboard data
    LockClipdata = 0x000A,
    /// Unlock clipboard data
    UnlockClipdata = 0x000B,
}

impl TryFrom<u16> for MessageType {
    type Error = ClipboardError;

    fn try_from(value: u16) -> ClipboardResult<Self> {
        Ok(match value {
            0x0001 => Self::MonitorReady,
            0x0002 => Self::FormatList,
            0x0003 => Self::FormatListResponse,
            0x0004 => Self::FormatDataRequest,
            0x0005 => Self::FormatDataResponse,
            0x0006 => Self::TemporaryDirectory,
            0x0007 => Self::ClipCaps,
            0x0008 => Self::FileContentsRequest,
            0x0009 => Self::FileContentsResponse,
            0x000A => Self::LockClipdata,
            0x000B => Self::UnlockClipdata,
            other => return Err(ClipboardError::UnknownMessageType(other)),
        })
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value as u16
    }
}

// =============================================================================
// PDU framing
// =============================================================================

/// A complete clipboard channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardPdu {
    /// Message type
    pub msg_type: MessageType,
    /// Message flags
    pub msg_flags: u16,
    /// Message body
    pub data: Bytes,
}

impl ClipboardPdu {
    /// Create a new PDU
    pub fn new(msg_type: MessageType, msg_flags: u16, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            msg_flags,
            data: data.into(),
        }
    }

    /// True if the response flags report failure
    pub fn is_fail(&self) -> bool {
        self.msg_flags & CB_RESPONSE_FAIL != 0
    }

    /// Append header and body to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> ClipboardResult<()> {
        let len = u32::try_from(self.data.len()).map_err(|_| ClipboardError::DataSizeExceeded {
            actual: self.data.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(PDU_HEADER_SIZE + self.data.len());
        dst.put_u16_le(self.msg_type.into());
        dst.put_u16_le(self.msg_flags);
        dst.put_u32_le(len);
        dst.put_slice(&self.data);
        Ok(())
    }

    /// Split one PDU off the front of `src`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete. Frames whose body is
    /// larger than `max_data_len` are rejected.
    pub fn decode(src: &mut BytesMut, max_data_len: usize) -> ClipboardResult<Option<Self>> {
        if src.len() < PDU_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..PDU_HEADER_SIZE];
        let raw_type = header.get_u16_le();
        let msg_flags = header.get_u16_le();
        let data_len = header.get_u32_le() as usize;

        if data_len > max_data_len {
            return Err(ClipboardError::DataSizeExceeded {
                actual: data_len,
                max: max_data_len,
            });
        }

        if src.len() < PDU_HEADER_SIZE + data_len {
            src.reserve(PDU_HEADER_SIZE + data_len - src.len());
            return Ok(None);
        }

        src.advance(PDU_HEADER_SIZE);
        let data = src.split_to(data_len).freeze();
        let msg_type = MessageType::try_from(raw_type)?;

        Ok(Some(Self {
            msg_type,
            msg_flags,
            data,
        }))
    }
}

// =============================================================================
// Format list
// =============================================================================

/// One entry of an inbound format list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatListEntry {
    /// Format ID
    pub format_id: u32,
    /// Format name (empty for predefined formats)
    pub name: String,
}

/// Encode a format list announcement with zero-filled name fields
pub fn encode_format_list(format_ids: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(format_ids.len() * FORMAT_RECORD_SIZE);
    for &format_id in format_ids {
        buf.put_u32_le(format_id);
        buf.put_bytes(0, FORMAT_NAME_SIZE);
    }
    buf.freeze()
}

/// Decode an inbound format list.
///
/// The payload length must be a multiple of [`FORMAT_RECORD_SIZE`]; anything
/// else is rejected as a whole.
pub fn decode_format_list(msg_flags: u16, data: &[u8]) -> ClipboardResult<Vec<FormatListEntry>> {
    if data.len() % FORMAT_RECORD_SIZE != 0 {
        return Err(ClipboardError::MalformedFormatList {
            length: data.len(),
            record_size: FORMAT_RECORD_SIZE,
        });
    }

    let ascii_names = msg_flags & CB_ASCII_NAMES != 0;
    Ok(data
        .chunks_exact(FORMAT_RECORD_SIZE)
        .map(|record| {
            let format_id = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let name = decode_short_name(&record[4..], ascii_names);
            FormatListEntry { format_id, name }
        })
        .collect())
}

fn decode_short_name(field: &[u8], ascii: bool) -> String {
    if ascii {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    } else {
        let units: Vec<u16> = field
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }
}

// =============================================================================
// Format data request
// =============================================================================

/// Encode a format data request
pub fn encode_data_request(format_id: u32) -> Bytes {
    Bytes::copy_from_slice(&format_id.to_le_bytes())
}

/// Decode a format data request
pub fn decode_data_request(data: &[u8]) -> ClipboardResult<u32> {
    if data.len() < 4 {
        return Err(ClipboardError::MalformedPdu(format!(
            "format data request is {} bytes, expected 4",
            data.len()
        )));
    }
    Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

// =============================================================================
// Capabilities
// =============================================================================

/// A capability set received from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Capability set type
    pub capability_type: u16,
    /// Declared length of the set, header included
    pub length: u16,
    /// Protocol version (general capability set only)
    pub version: Option<u32>,
    /// General flags (general capability set only)
    pub general_flags: Option<u32>,
}

/// The fixed capability block the bridge sends
pub fn encode_capabilities() -> Bytes {
    let mut buf = BytesMut::with_capacity(CAPABILITIES_SIZE);
    buf.put_u16_le(1); // cCapabilitiesSets
    buf.put_u16_le(0); // pad1
    buf.put_u16_le(CB_CAPSTYPE_GENERAL);
    buf.put_u16_le(GENERAL_CAPABILITY_LENGTH);
    buf.put_u32_le(CB_CAPS_VERSION_2);
    buf.put_u32_le(0); // generalFlags
    buf.freeze()
}

/// Decode an inbound capabilities PDU. Used for logging only.
pub fn decode_capabilities(data: &[u8]) -> ClipboardResult<Vec<CapabilitySet>> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return Err(ClipboardError::MalformedPdu("capabilities header truncated".into()));
    }
    let count = buf.get_u16_le();
    let _pad = buf.get_u16_le();

    let mut sets = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(ClipboardError::MalformedPdu("capability set header truncated".into()));
        }
        let capability_type = buf.get_u16_le();
        let length = buf.get_u16_le();
        let body_len = usize::from(length)
            .checked_sub(4)
            .ok_or_else(|| ClipboardError::MalformedPdu(format!("capability length {}", length)))?;
        if buf.remaining() < body_len {
            return Err(ClipboardError::MalformedPdu("capability set body truncated".into()));
        }

        let mut body = &buf[..body_len];
        let (version, general_flags) = if capability_type == CB_CAPSTYPE_GENERAL && body.len() >= 8 {
            (Some(body.get_u32_le()), Some(body.get_u32_le()))
        } else {
            (None, None)
        };
        buf.advance(body_len);

        sets.push(CapabilitySet {
            capability_type,
            length,
            version,
            general_flags,
        });
    }
    Ok(sets)
}
