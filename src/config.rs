//! Server configuration
//!
//! Limits and windows that shape a responder connection. Values are checked
//! once by [`ServerConfigBuilder::build`].

use crate::error::{Error, Result};
use crate::codec::FRAME_HEADER_SIZE;
use crate::{DEFAULT_SEND_WINDOW, MAX_FRAME_LENGTH, MAX_REQUEST_N};

/// Responder connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Initial local send window of each stream, in frames (default: 256)
    pub initial_send_window: u64,

    /// Maximum concurrently open streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Largest frame accepted from the transport (default: 2^24-1)
    pub max_frame_length: usize,
}

impl ServerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        ServerConfig {
            initial_send_window: DEFAULT_SEND_WINDOW,
            max_concurrent_streams: None,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.initial_send_window > MAX_REQUEST_N as u64 {
            return Err(Error::InvalidConfig(format!(
                "Initial send window {} exceeds maximum (2^31-1)",
                self.initial_send_window
            )));
        }

        if self.max_concurrent_streams == Some(0) {
            return Err(Error::InvalidConfig(
                "Max concurrent streams must be greater than zero".to_string(),
            ));
        }

        if self.max_frame_length < FRAME_HEADER_SIZE || self.max_frame_length > MAX_FRAME_LENGTH {
            return Err(Error::InvalidConfig(format!(
                "Max frame length {} outside valid range ({}-{})",
                self.max_frame_length, FRAME_HEADER_SIZE, MAX_FRAME_LENGTH
            )));
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`ServerConfig`]
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        ServerConfigBuilder {
            config: ServerConfig::new(),
        }
    }

    /// Set the initial per-stream send window
    pub fn initial_send_window(mut self, frames: u64) -> Self {
        self.config.initial_send_window = frames;
        self
    }

    /// Limit concurrently open streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = Some(max);
        self
    }

    /// Set the largest accepted frame
    pub fn max_frame_length(mut self, length: usize) -> Self {
        self.config.max_frame_length = length;
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
