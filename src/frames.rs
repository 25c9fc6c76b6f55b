//! Frame types and utilities
//!
//! This module defines the frames exchanged on a connection. Decoded frames are
//! a closed enum so the dispatcher matches them exhaustively.

use crate::error::ErrorCode;
use crate::payload::Payload;
use crate::StreamId;
use bytes::Bytes;
use std::fmt;

/// Frame type codes (6 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Reserved (0x00)
    Reserved = 0x00,
    /// SETUP (0x01) - Sent by the client to initiate the connection
    Setup = 0x01,
    /// LEASE (0x02) - Grants the peer the right to send requests
    Lease = 0x02,
    /// KEEPALIVE (0x03) - Connection keepalive
    Keepalive = 0x03,
    /// REQUEST_RESPONSE (0x04) - Request a single response
    RequestResponse = 0x04,
    /// REQUEST_FNF (0x05) - Fire-and-forget, no response
    RequestFnf = 0x05,
    /// REQUEST_STREAM (0x06) - Request a finite or infinite stream
    RequestStream = 0x06,
    /// REQUEST_CHANNEL (0x07) - Bi-directional stream
    RequestChannel = 0x07,
    /// REQUEST_N (0x08) - Request N more items
    RequestN = 0x08,
    /// CANCEL (0x09) - Cancel an outstanding request
    Cancel = 0x09,
    /// PAYLOAD (0x0A) - NEXT, COMPLETE or NEXT_COMPLETE depending on flags
    Payload = 0x0A,
    /// ERROR (0x0B) - Stream or connection error
    Error = 0x0B,
    /// METADATA_PUSH (0x0C) - Connection-level metadata
    MetadataPush = 0x0C,
    /// RESUME (0x0D) - Resumption request
    Resume = 0x0D,
    /// RESUME_OK (0x0E) - Resumption acknowledgement
    ResumeOk = 0x0E,
    /// EXT (0x3F) - Extension frame
    Ext = 0x3F,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(FrameType::Reserved),
            0x01 => Some(FrameType::Setup),
            0x02 => Some(FrameType::Lease),
            0x03 => Some(FrameType::Keepalive),
            0x04 => Some(FrameType::RequestResponse),
            0x05 => Some(FrameType::RequestFnf),
            0x06 => Some(FrameType::RequestStream),
            0x07 => Some(FrameType::RequestChannel),
            0x08 => Some(FrameType::RequestN),
            0x09 => Some(FrameType::Cancel),
            0x0A => Some(FrameType::Payload),
            0x0B => Some(FrameType::Error),
            0x0C => Some(FrameType::MetadataPush),
            0x0D => Some(FrameType::Resume),
            0x0E => Some(FrameType::ResumeOk),
            0x3F => Some(FrameType::Ext),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Reserved => "RESERVED",
            FrameType::Setup => "SETUP",
            FrameType::Lease => "LEASE",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::MetadataPush => "METADATA_PUSH",
            FrameType::Resume => "RESUME",
            FrameType::ResumeOk => "RESUME_OK",
            FrameType::Ext => "EXT",
        }
    }

    /// Whether frames of this type may carry a metadata block
    pub fn can_have_metadata(&self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
                | FrameType::MetadataPush
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flags (10 bits on the wire)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// Mask of the bits that belong to flags
    pub const MASK: u16 = 0x03FF;

    /// IGNORE flag (0x200) - frame may be ignored if not understood
    pub const IGNORE: u16 = 0x200;

    /// METADATA flag (0x100) - metadata block present
    pub const METADATA: u16 = 0x100;

    /// FOLLOWS flag (0x80) - more fragments follow
    pub const FOLLOWS: u16 = 0x80;

    /// RESPOND flag (0x80) - KEEPALIVE wants a reply
    pub const RESPOND: u16 = 0x80;

    /// RESUME_ENABLE flag (0x80) - SETUP carries a resume token
    pub const RESUME_ENABLE: u16 = 0x80;

    /// LEASE flag (0x40) - SETUP asks for leasing
    pub const LEASE: u16 = 0x40;

    /// COMPLETE flag (0x40) - stream completion
    pub const COMPLETE: u16 = 0x40;

    /// NEXT flag (0x20) - payload carries an item
    pub const NEXT: u16 = 0x20;

    /// Create empty flags
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Create from u16, discarding bits outside the flag field
    pub fn from_u16(flags: u16) -> Self {
        FrameFlags(flags & Self::MASK)
    }

    /// Get raw u16 value
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Set a flag
    pub fn set(&mut self, flag: u16) {
        self.0 |= flag & Self::MASK;
    }

    /// Set a flag when `on` is true
    pub fn set_if(&mut self, flag: u16, on: bool) {
        if on {
            self.set(flag);
        }
    }

    /// Check if a flag is set
    pub fn is_set(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Check if METADATA is set
    pub fn has_metadata(&self) -> bool {
        self.is_set(Self::METADATA)
    }

    /// Check if FOLLOWS is set
    pub fn is_follows(&self) -> bool {
        self.is_set(Self::FOLLOWS)
    }

    /// Check if COMPLETE is set
    pub fn is_complete(&self) -> bool {
        self.is_set(Self::COMPLETE)
    }

    /// Check if NEXT is set
    pub fn is_next(&self) -> bool {
        self.is_set(Self::NEXT)
    }

    /// Check if IGNORE is set
    pub fn is_ignore(&self) -> bool {
        self.is_set(Self::IGNORE)
    }
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// SETUP frame
    Setup(SetupFrame),
    /// KEEPALIVE frame
    Keepalive(KeepaliveFrame),
    /// REQUEST_RESPONSE frame
    RequestResponse(RequestFrame),
    /// REQUEST_FNF frame
    RequestFnf(RequestFrame),
    /// REQUEST_STREAM frame
    RequestStream(RequestFrame),
    /// REQUEST_CHANNEL frame
    RequestChannel(RequestFrame),
    /// REQUEST_N frame
    RequestN(RequestNFrame),
    /// CANCEL frame
    Cancel(CancelFrame),
    /// PAYLOAD frame (NEXT / COMPLETE / NEXT_COMPLETE)
    Payload(PayloadFrame),
    /// ERROR frame
    Error(ErrorFrame),
    /// METADATA_PUSH frame
    MetadataPush(MetadataPushFrame),
}

impl Frame {
    /// Stream the frame belongs to
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Setup(_) | Frame::Keepalive(_) | Frame::MetadataPush(_) => {
                crate::CONNECTION_STREAM_ID
            }
            Frame::RequestResponse(f)
            | Frame::RequestFnf(f)
            | Frame::RequestStream(f)
            | Frame::RequestChannel(f) => f.stream_id,
            Frame::RequestN(f) => f.stream_id,
            Frame::Cancel(f) => f.stream_id,
            Frame::Payload(f) => f.stream_id,
            Frame::Error(f) => f.stream_id,
        }
    }

    /// Wire frame type
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Setup(_) => FrameType::Setup,
            Frame::Keepalive(_) => FrameType::Keepalive,
            Frame::RequestResponse(_) => FrameType::RequestResponse,
            Frame::RequestFnf(_) => FrameType::RequestFnf,
            Frame::RequestStream(_) => FrameType::RequestStream,
            Frame::RequestChannel(_) => FrameType::RequestChannel,
            Frame::RequestN(_) => FrameType::RequestN,
            Frame::Cancel(_) => FrameType::Cancel,
            Frame::Payload(_) => FrameType::Payload,
            Frame::Error(_) => FrameType::Error,
            Frame::MetadataPush(_) => FrameType::MetadataPush,
        }
    }

    /// Name used in logs; PAYLOAD frames are named after their flags
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Payload(f) => match (f.next, f.complete) {
                (true, true) => "NEXT_COMPLETE",
                (true, false) => "NEXT",
                (false, true) => "COMPLETE",
                (false, false) => "PAYLOAD",
            },
            other => other.frame_type().name(),
        }
    }

    /// Whether this frame carries a response item (consumes send window)
    pub fn is_next(&self) -> bool {
        matches!(self, Frame::Payload(f) if f.next)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stream {})", self.name(), self.stream_id())
    }
}

/// SETUP frame
#[derive(Debug, Clone, PartialEq)]
pub struct SetupFrame {
    /// Protocol major version
    pub major_version: u16,
    /// Protocol minor version
    pub minor_version: u16,
    /// Keepalive interval in milliseconds
    pub keepalive_interval: u32,
    /// Maximum lifetime without keepalive in milliseconds
    pub max_lifetime: u32,
    /// Resume token (RESUME_ENABLE flag)
    pub resume_token: Option<Bytes>,
    /// Client asks for leasing
    pub lease: bool,
    /// Metadata MIME type
    pub metadata_mime_type: String,
    /// Data MIME type
    pub data_mime_type: String,
    /// Setup payload
    pub payload: Payload,
}

/// KEEPALIVE frame
#[derive(Debug, Clone, PartialEq)]
pub struct KeepaliveFrame {
    /// RESPOND flag
    pub respond: bool,
    /// Last received position (resumption; always 0 here)
    pub last_received_position: u64,
    /// Opaque data echoed back in the reply
    pub data: Bytes,
}

impl KeepaliveFrame {
    /// Create a new KEEPALIVE frame
    pub fn new(respond: bool, data: Bytes) -> Self {
        KeepaliveFrame {
            respond,
            last_received_position: 0,
            data,
        }
    }

    /// Reply to this frame; the reply never asks for a reply itself
    pub fn reply(&self) -> Self {
        KeepaliveFrame {
            respond: false,
            last_received_position: 0,
            data: self.data.clone(),
        }
    }
}

/// REQUEST_RESPONSE, REQUEST_FNF, REQUEST_STREAM and REQUEST_CHANNEL frames
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// Stream ID
    pub stream_id: StreamId,
    /// Initial request N (REQUEST_STREAM / REQUEST_CHANNEL; 1 for the others)
    pub initial_request_n: u32,
    /// FOLLOWS flag
    pub follows: bool,
    /// COMPLETE flag (REQUEST_CHANNEL only)
    pub complete: bool,
    /// Request payload
    pub payload: Payload,
}

impl RequestFrame {
    /// Create a request frame with an initial request N of 1
    pub fn new(stream_id: StreamId, payload: Payload) -> Self {
        RequestFrame {
            stream_id,
            initial_request_n: 1,
            follows: false,
            complete: false,
            payload,
        }
    }

    /// Set initial request N
    pub fn with_initial_request_n(mut self, n: u32) -> Self {
        self.initial_request_n = n;
        self
    }

    /// Set COMPLETE flag
    pub fn with_complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    /// Set FOLLOWS flag
    pub fn with_follows(mut self, follows: bool) -> Self {
        self.follows = follows;
        self
    }
}

/// REQUEST_N frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestNFrame {
    /// Stream ID
    pub stream_id: StreamId,
    /// Additional items requested (1..=2^31-1)
    pub request_n: u32,
}

impl RequestNFrame {
    /// Create a new REQUEST_N frame
    pub fn new(stream_id: StreamId, request_n: u32) -> Self {
        RequestNFrame {
            stream_id,
            request_n,
        }
    }
}

/// CANCEL frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelFrame {
    /// Stream ID
    pub stream_id: StreamId,
}

impl CancelFrame {
    /// Create a new CANCEL frame
    pub fn new(stream_id: StreamId) -> Self {
        CancelFrame { stream_id }
    }
}

/// PAYLOAD frame
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFrame {
    /// Stream ID
    pub stream_id: StreamId,
    /// FOLLOWS flag
    pub follows: bool,
    /// COMPLETE flag
    pub complete: bool,
    /// NEXT flag
    pub next: bool,
    /// Payload (empty unless NEXT)
    pub payload: Payload,
}

impl PayloadFrame {
    /// NEXT frame
    pub fn next(stream_id: StreamId, payload: Payload) -> Self {
        PayloadFrame {
            stream_id,
            follows: false,
            complete: false,
            next: true,
            payload,
        }
    }

    /// NEXT_COMPLETE frame
    pub fn next_complete(stream_id: StreamId, payload: Payload) -> Self {
        PayloadFrame {
            stream_id,
            follows: false,
            complete: true,
            next: true,
            payload,
        }
    }

    /// COMPLETE frame
    pub fn complete(stream_id: StreamId) -> Self {
        PayloadFrame {
            stream_id,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::empty(),
        }
    }
}

/// ERROR frame
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    /// Stream ID (0 for connection errors)
    pub stream_id: StreamId,
    /// Raw error code
    pub code: u32,
    /// UTF-8 error message
    pub message: String,
}

impl ErrorFrame {
    /// Create a new ERROR frame
    pub fn new(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorFrame {
            stream_id,
            code: code.as_u32(),
            message: message.into(),
        }
    }

    /// Known error code, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }
}

/// METADATA_PUSH frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPushFrame {
    /// Pushed metadata
    pub metadata: Bytes,
}

impl MetadataPushFrame {
    /// Create a new METADATA_PUSH frame
    pub fn new(metadata: Bytes) -> Self {
        MetadataPushFrame { metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Setup.as_u8(), 0x01);
        assert_eq!(FrameType::RequestChannel.as_u8(), 0x07);
        assert_eq!(FrameType::Ext.as_u8(), 0x3F);

        assert_eq!(FrameType::from_u8(0x0A), Some(FrameType::Payload));
        assert_eq!(FrameType::from_u8(0x0C), Some(FrameType::MetadataPush));
        assert_eq!(FrameType::from_u8(0x10), None);
    }

    #[test]
    fn test_frame_type_name() {
        assert_eq!(FrameType::RequestFnf.name(), "REQUEST_FNF");
        assert_eq!(FrameType::Keepalive.to_string(), "KEEPALIVE");
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        assert!(!flags.has_metadata());

        flags.set(FrameFlags::METADATA);
        flags.set_if(FrameFlags::NEXT, true);
        flags.set_if(FrameFlags::COMPLETE, false);
        assert!(flags.has_metadata());
        assert!(flags.is_next());
        assert!(!flags.is_complete());
        assert_eq!(flags.as_u16(), 0x120);

        // Type bits are not flags
        assert_eq!(FrameFlags::from_u16(0xFC00 | 0x40).as_u16(), 0x40);
    }

    #[test]
    fn test_payload_frame_names() {
        let next = Frame::Payload(PayloadFrame::next(1, Payload::empty()));
        let complete = Frame::Payload(PayloadFrame::complete(1));
        let both = Frame::Payload(PayloadFrame::next_complete(1, Payload::empty()));

        assert_eq!(next.name(), "NEXT");
        assert_eq!(complete.name(), "COMPLETE");
        assert_eq!(both.name(), "NEXT_COMPLETE");
        assert!(next.is_next());
        assert!(!complete.is_next());
        assert!(both.is_next());
    }

    #[test]
    fn test_connection_frames_use_stream_zero() {
        let keepalive = Frame::Keepalive(KeepaliveFrame::new(true, Bytes::new()));
        assert_eq!(keepalive.stream_id(), 0);

        let push = Frame::MetadataPush(MetadataPushFrame::new(Bytes::from_static(b"m")));
        assert_eq!(push.stream_id(), 0);
        assert_eq!(push.frame_type(), FrameType::MetadataPush);
    }

    #[test]
    fn test_keepalive_reply_clears_respond() {
        let ping = KeepaliveFrame::new(true, Bytes::from_static(b"ping"));
        let pong = ping.reply();
        assert!(!pong.respond);
        assert_eq!(pong.data, ping.data);
    }
}
