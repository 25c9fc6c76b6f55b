//! Request and response payloads
//!
//! A payload is an optional metadata block plus a data block. The engine never
//! interprets either; application serialization is the responder's business.

use bytes::Bytes;
use std::str::Utf8Error;

/// Payload carried by data-bearing frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    metadata: Option<Bytes>,
    data: Bytes,
}

impl Payload {
    /// Create a payload from metadata and data
    pub fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Payload { metadata, data }
    }

    /// Create a payload without metadata
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Payload {
            metadata: None,
            data: data.into(),
        }
    }

    /// Create an empty payload
    pub fn empty() -> Self {
        Payload::default()
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Get metadata
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Check whether metadata is present
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Get data
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Get data as UTF-8
    pub fn data_utf8(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.data)
    }

    /// Encoded size of metadata (without length prefix) and data
    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, Bytes::len) + self.data.len()
    }

    /// Check if both metadata and data are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into metadata and data
    pub fn into_parts(self) -> (Option<Bytes>, Bytes) {
        (self.metadata, self.data)
    }
}

/// Builds payloads out of decoded frame buffers
///
/// Decoded frames slice into the buffer they were read from. The factory
/// decides whether a payload handed to the responder keeps that buffer alive
/// or gets its own copy.
pub trait PayloadFactory: Send + Sync {
    /// Build a payload from the metadata and data slices of a frame
    fn create(&self, metadata: Option<Bytes>, data: Bytes) -> Payload;
}

/// Copies metadata and data into fresh buffers
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPayloadFactory;

impl PayloadFactory for DefaultPayloadFactory {
    fn create(&self, metadata: Option<Bytes>, data: Bytes) -> Payload {
        Payload {
            metadata: metadata.map(|m| Bytes::copy_from_slice(&m)),
            data: Bytes::copy_from_slice(&data),
        }
    }
}

/// Shares the frame buffer with the payload
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroCopyPayloadFactory;

impl PayloadFactory for ZeroCopyPayloadFactory {
    fn create(&self, metadata: Option<Bytes>, data: Bytes) -> Payload {
        Payload { metadata, data }
    }
}
