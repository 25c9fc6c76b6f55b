//! Frame encoding and decoding
//!
//! Frame layout:
//!
//! ```text
//! +--------------------------------+----------------+--------------+
//! | 0 | stream id (31 bits)        | type (6 bits)  | flags (10)   |
//! +--------------------------------+----------------+--------------+
//! | type specific fields, optional 24-bit metadata length,         |
//! | metadata, data                                                 |
//! +----------------------------------------------------------------+
//! ```
//!
//! On byte-stream transports every frame is preceded by a 24-bit big-endian
//! length.

use crate::error::{Error, Result};
use crate::frames::*;
use crate::payload::Payload;
use crate::{StreamId, FRAME_LENGTH_SIZE, MAX_FRAME_LENGTH, MAX_REQUEST_N, MAX_STREAM_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Frame header size (6 bytes)
pub const FRAME_HEADER_SIZE: usize = 6;

/// Size of the metadata length prefix (3 bytes)
pub const METADATA_LENGTH_SIZE: usize = 3;

/// Largest metadata block expressible in the 24-bit length prefix
pub const MAX_METADATA_LENGTH: usize = 0x00FF_FFFF;

/// Frame codec
///
/// Holds a reusable write buffer; frames encoded through it share one
/// allocation until the buffer has to grow.
pub struct FrameCodec {
    write_buffer: BytesMut,
}

impl FrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create a codec whose write buffer starts with `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        FrameCodec {
            write_buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Encode a frame with its transport length prefix
    pub fn encode_length_prefixed(&mut self, frame: &Frame) -> Result<Bytes> {
        self.write_buffer.put_uint(0, FRAME_LENGTH_SIZE);
        if let Err(error) = Self::encode(frame, &mut self.write_buffer) {
            self.write_buffer.clear();
            return Err(error);
        }

        let length = self.write_buffer.len() - FRAME_LENGTH_SIZE;
        if length > MAX_FRAME_LENGTH {
            self.write_buffer.clear();
            return Err(Error::FrameTooLarge(length));
        }
        let prefix = (length as u32).to_be_bytes();
        self.write_buffer[..FRAME_LENGTH_SIZE].copy_from_slice(&prefix[1..]);

        Ok(self.write_buffer.split().freeze())
    }

    /// Encode a frame header
    pub fn encode_header(stream_id: StreamId, frame_type: FrameType, flags: FrameFlags) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Stream ID (31 bits, reserved bit is 0)
        let stream_id = (stream_id & MAX_STREAM_ID).to_be_bytes();
        header[..4].copy_from_slice(&stream_id);

        // Type (6 bits) and flags (10 bits)
        let type_and_flags = ((frame_type.as_u8() as u16) << 10) | flags.as_u16();
        header[4..].copy_from_slice(&type_and_flags.to_be_bytes());

        header
    }

    /// Decode a frame header
    ///
    /// Returns the stream ID, the raw 6-bit type code and the flags.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (StreamId, u8, FrameFlags) {
        let stream_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & MAX_STREAM_ID;
        let type_and_flags = u16::from_be_bytes([bytes[4], bytes[5]]);
        let frame_type = (type_and_flags >> 10) as u8;
        let flags = FrameFlags::from_u16(type_and_flags);

        (stream_id, frame_type, flags)
    }

    /// Encode a frame (without transport length prefix) into `dst`
    ///
    /// Fails if a field does not fit its length prefix. `dst` may then hold a
    /// partial frame.
    pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            Frame::Setup(f) => Self::encode_setup_frame(f, dst)?,
            Frame::Keepalive(f) => Self::encode_keepalive_frame(f, dst),
            Frame::RequestResponse(f) => Self::encode_request_frame(FrameType::RequestResponse, f, dst)?,
            Frame::RequestFnf(f) => Self::encode_request_frame(FrameType::RequestFnf, f, dst)?,
            Frame::RequestStream(f) => Self::encode_request_frame(FrameType::RequestStream, f, dst)?,
            Frame::RequestChannel(f) => Self::encode_request_frame(FrameType::RequestChannel, f, dst)?,
            Frame::RequestN(f) => {
                dst.put_slice(&Self::encode_header(f.stream_id, FrameType::RequestN, FrameFlags::empty()));
                dst.put_u32(f.request_n & MAX_REQUEST_N);
            }
            Frame::Cancel(f) => {
                dst.put_slice(&Self::encode_header(f.stream_id, FrameType::Cancel, FrameFlags::empty()));
            }
            Frame::Payload(f) => Self::encode_payload_frame(f, dst)?,
            Frame::Error(f) => {
                dst.put_slice(&Self::encode_header(f.stream_id, FrameType::Error, FrameFlags::empty()));
                dst.put_u32(f.code);
                dst.put_slice(f.message.as_bytes());
            }
            Frame::MetadataPush(f) => {
                let flags = FrameFlags::from_u16(FrameFlags::METADATA);
                dst.put_slice(&Self::encode_header(0, FrameType::MetadataPush, flags));
                dst.put_slice(&f.metadata);
            }
        }
        Ok(())
    }

    /// Encode a frame into a fresh buffer
    pub fn encode_to_bytes(frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        Self::encode(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_setup_frame(frame: &SetupFrame, dst: &mut BytesMut) -> Result<()> {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::METADATA, frame.payload.has_metadata());
        flags.set_if(FrameFlags::RESUME_ENABLE, frame.resume_token.is_some());
        flags.set_if(FrameFlags::LEASE, frame.lease);

        dst.put_slice(&Self::encode_header(0, FrameType::Setup, flags));
        dst.put_u16(frame.major_version);
        dst.put_u16(frame.minor_version);
        dst.put_u32(frame.keepalive_interval & 0x7FFF_FFFF);
        dst.put_u32(frame.max_lifetime & 0x7FFF_FFFF);
        if let Some(token) = &frame.resume_token {
            dst.put_u16(prefixed_len(token.len(), u16::MAX as usize, "resume token")? as u16);
            dst.put_slice(token);
        }
        for (mime_type, field) in [
            (&frame.metadata_mime_type, "metadata MIME type"),
            (&frame.data_mime_type, "data MIME type"),
        ] {
            dst.put_u8(prefixed_len(mime_type.len(), u8::MAX as usize, field)? as u8);
            dst.put_slice(mime_type.as_bytes());
        }
        Self::encode_payload(&frame.payload, dst)
    }

    fn encode_keepalive_frame(frame: &KeepaliveFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::RESPOND, frame.respond);

        dst.put_slice(&Self::encode_header(0, FrameType::Keepalive, flags));
        dst.put_u64(frame.last_received_position & 0x7FFF_FFFF_FFFF_FFFF);
        dst.put_slice(&frame.data);
    }

    fn encode_request_frame(frame_type: FrameType, frame: &RequestFrame, dst: &mut BytesMut) -> Result<()> {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::METADATA, frame.payload.has_metadata());
        flags.set_if(FrameFlags::FOLLOWS, frame.follows);
        flags.set_if(
            FrameFlags::COMPLETE,
            frame.complete && frame_type == FrameType::RequestChannel,
        );

        dst.put_slice(&Self::encode_header(frame.stream_id, frame_type, flags));
        if matches!(frame_type, FrameType::RequestStream | FrameType::RequestChannel) {
            dst.put_u32(frame.initial_request_n & MAX_REQUEST_N);
        }
        Self::encode_payload(&frame.payload, dst)
    }

    fn encode_payload_frame(frame: &PayloadFrame, dst: &mut BytesMut) -> Result<()> {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::METADATA, frame.next && frame.payload.has_metadata());
        flags.set_if(FrameFlags::FOLLOWS, frame.follows);
        flags.set_if(FrameFlags::COMPLETE, frame.complete);
        flags.set_if(FrameFlags::NEXT, frame.next);

        dst.put_slice(&Self::encode_header(frame.stream_id, FrameType::Payload, flags));
        if frame.next {
            Self::encode_payload(&frame.payload, dst)?;
        }
        Ok(())
    }

    fn encode_payload(payload: &Payload, dst: &mut BytesMut) -> Result<()> {
        if let Some(metadata) = payload.metadata() {
            let len = prefixed_len(metadata.len(), MAX_METADATA_LENGTH, "metadata")?;
            dst.put_uint(len as u64, METADATA_LENGTH_SIZE);
            dst.put_slice(metadata);
        }
        dst.put_slice(payload.data());
        Ok(())
    }

    /// Decode one frame (without transport length prefix)
    pub fn decode(mut buf: Bytes) -> Result<Frame> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(Error::FrameTooShort(buf.len()));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        buf.copy_to_slice(&mut header);
        let (stream_id, type_code, flags) = Self::decode_header(&header);

        let frame_type = FrameType::from_u8(type_code).ok_or(Error::UnsupportedFrameType(type_code))?;
        let mut body = Body { buf, stream_id };

        let frame = match frame_type {
            FrameType::Setup => Frame::Setup(body.setup(flags)?),
            FrameType::Keepalive => {
                let position = body.u64("last received position")? & 0x7FFF_FFFF_FFFF_FFFF;
                Frame::Keepalive(KeepaliveFrame {
                    respond: flags.is_set(FrameFlags::RESPOND),
                    last_received_position: position,
                    data: body.rest(),
                })
            }
            FrameType::RequestResponse => Frame::RequestResponse(body.request(frame_type, flags)?),
            FrameType::RequestFnf => Frame::RequestFnf(body.request(frame_type, flags)?),
            FrameType::RequestStream => Frame::RequestStream(body.request(frame_type, flags)?),
            FrameType::RequestChannel => Frame::RequestChannel(body.request(frame_type, flags)?),
            FrameType::RequestN => {
                let request_n = body.request_n("request N")?;
                Frame::RequestN(RequestNFrame::new(stream_id, request_n))
            }
            FrameType::Cancel => Frame::Cancel(CancelFrame::new(stream_id)),
            FrameType::Payload => {
                let payload = if flags.is_next() {
                    body.payload(flags)?
                } else {
                    Payload::empty()
                };
                Frame::Payload(PayloadFrame {
                    stream_id,
                    follows: flags.is_follows(),
                    complete: flags.is_complete(),
                    next: flags.is_next(),
                    payload,
                })
            }
            FrameType::Error => {
                let code = body.u32("error code")?;
                let message = String::from_utf8_lossy(&body.rest()).into_owned();
                Frame::Error(ErrorFrame {
                    stream_id,
                    code,
                    message,
                })
            }
            FrameType::MetadataPush => Frame::MetadataPush(MetadataPushFrame::new(body.rest())),
            FrameType::Reserved | FrameType::Lease | FrameType::Resume | FrameType::ResumeOk | FrameType::Ext => {
                return Err(Error::UnsupportedFrameType(type_code));
            }
        };

        Ok(frame)
    }

    /// Write one length-prefixed frame (already encoded) to a writer
    pub fn write_frame<W: Write>(writer: &mut W, frame_data: &[u8]) -> io::Result<()> {
        writer.write_all(frame_data)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one length-prefixed frame from a reader
    ///
    /// Returns `Ok(None)` when the reader is at end of stream before the
    /// length prefix; end of stream inside a frame is an error.
    pub fn read_frame<R: Read>(reader: &mut R, max_frame_length: usize) -> io::Result<Option<Bytes>> {
        let mut prefix = [0u8; FRAME_LENGTH_SIZE];
        let mut read = 0;
        while read < FRAME_LENGTH_SIZE {
            let n = match reader.read(&mut prefix[read..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Connection closed"));
            }
            read += n;
        }

        let length = ((prefix[0] as usize) << 16) | ((prefix[1] as usize) << 8) | (prefix[2] as usize);

        // Validate frame length
        if length > max_frame_length.min(MAX_FRAME_LENGTH) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {}", length),
            ));
        }

        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame)?;

        Ok(Some(Bytes::from(frame)))
    }
}

/// Length of a prefixed field, rejected if the prefix cannot express it
fn prefixed_len(len: usize, max: usize, field: &str) -> Result<usize> {
    if len > max {
        return Err(Error::InvalidFrame {
            stream_id: 0,
            reason: format!("{} of {} bytes exceeds {} bytes", field, len, max),
        });
    }
    Ok(len)
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a frame body that reports truncation as an invalid frame
struct Body {
    buf: Bytes,
    stream_id: StreamId,
}

impl Body {
    fn invalid(&self, reason: String) -> Error {
        Error::InvalidFrame {
            stream_id: self.stream_id,
            reason,
        }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(self.invalid(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<Bytes> {
        self.need(n, what)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }

    fn request_n(&mut self, what: &str) -> Result<u32> {
        let n = self.u32(what)? & MAX_REQUEST_N;
        if n == 0 {
            return Err(self.invalid(format!("{} must be positive", what)));
        }
        Ok(n)
    }

    fn string(&mut self, n: usize, what: &str) -> Result<String> {
        let raw = self.bytes(n, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| self.invalid(format!("{} is not UTF-8", what)))
    }

    fn payload(&mut self, flags: FrameFlags) -> Result<Payload> {
        let metadata = if flags.has_metadata() {
            self.need(METADATA_LENGTH_SIZE, "metadata length")?;
            let length = self.buf.get_uint(METADATA_LENGTH_SIZE) as usize;
            Some(self.bytes(length, "metadata")?)
        } else {
            None
        };
        Ok(Payload::new(metadata, self.rest()))
    }

    fn request(&mut self, frame_type: FrameType, flags: FrameFlags) -> Result<RequestFrame> {
        let initial_request_n = match frame_type {
            FrameType::RequestStream | FrameType::RequestChannel => self.request_n("initial request N")?,
            _ => 1,
        };
        let payload = self.payload(flags)?;

        Ok(RequestFrame {
            stream_id: self.stream_id,
            initial_request_n,
            follows: flags.is_follows(),
            complete: frame_type == FrameType::RequestChannel && flags.is_complete(),
            payload,
        })
    }

    fn setup(&mut self, flags: FrameFlags) -> Result<SetupFrame> {
        let major_version = self.u16("major version")?;
        let minor_version = self.u16("minor version")?;
        let keepalive_interval = self.u32("keepalive interval")? & 0x7FFF_FFFF;
        let max_lifetime = self.u32("max lifetime")? & 0x7FFF_FFFF;
        let resume_token = if flags.is_set(FrameFlags::RESUME_ENABLE) {
            let length = self.u16("resume token length")? as usize;
            Some(self.bytes(length, "resume token")?)
        } else {
            None
        };
        let length = self.u8("metadata mime length")? as usize;
        let metadata_mime_type = self.string(length, "metadata mime type")?;
        let length = self.u8("data mime length")? as usize;
        let data_mime_type = self.string(length, "data mime type")?;
        let payload = self.payload(flags)?;

        Ok(SetupFrame {
            major_version,
            minor_version,
            keepalive_interval,
            max_lifetime,
            resume_token,
            lease: flags.is_set(FrameFlags::LEASE),
            metadata_mime_type,
            data_mime_type,
            payload,
        })
    }
}
