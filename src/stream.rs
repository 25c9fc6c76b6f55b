//! Stream records and the stream registry
//!
//! Every open request has one [`StreamRecord`], shared between the dispatch
//! path and the producer's delivery callbacks. The record's mutable state sits
//! behind its own lock so unrelated streams never contend. The registry maps
//! stream ids to records and is locked separately; code never holds a record
//! lock while taking the registry lock.

use crate::error::{Error, Result};
use crate::flow_control::DemandController;
use crate::frames::FrameType;
use crate::inbound::Inbound;
use crate::producer::ProducerHandle;
use crate::StreamId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Interaction model of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// One response item
    RequestResponse,
    /// Many response items
    RequestStream,
    /// Many items in both directions
    RequestChannel,
    /// No response
    FireAndForget,
}

impl StreamKind {
    /// Interaction started by a request frame type
    pub fn from_frame_type(frame_type: FrameType) -> Option<Self> {
        match frame_type {
            FrameType::RequestResponse => Some(StreamKind::RequestResponse),
            FrameType::RequestStream => Some(StreamKind::RequestStream),
            FrameType::RequestChannel => Some(StreamKind::RequestChannel),
            FrameType::RequestFnf => Some(StreamKind::FireAndForget),
            _ => None,
        }
    }

    /// Get interaction name
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::RequestResponse => "Request-Response",
            StreamKind::RequestStream => "Request-Stream",
            StreamKind::RequestChannel => "Request-Channel",
            StreamKind::FireAndForget => "Fire-and-Forget",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a stream reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Producer completed
    Completed,
    /// Producer failed; an ERROR frame was sent
    Errored,
    /// Peer sent CANCEL
    Cancelled,
    /// Peer sent ERROR
    PeerError,
    /// Transport failed or the server was disposed
    ConnectionLost,
}

/// Outbound stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Record exists, producer not attached yet
    Idle,
    /// Producer attached and paced by credit
    Demanding,
    /// Absorbing final state
    Terminal(Termination),
}

impl StreamState {
    /// Check if the stream reached its final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Terminal(_))
    }
}

/// Mutable part of a stream record
pub(crate) struct StreamInner {
    pub(crate) state: StreamState,
    pub(crate) demand: DemandController,
    /// Attached producer; taken out on termination
    pub(crate) producer: Option<Arc<dyn ProducerHandle>>,
    /// Inbound half of a channel
    pub(crate) inbound: Option<Arc<Inbound>>,
    /// Peer may still send items on the inbound half
    pub(crate) inbound_open: bool,
}

impl StreamInner {
    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `Terminal` and release the producer
    ///
    /// Returns `None` if the stream was already terminal, otherwise the
    /// producer handle that was attached, if any.
    pub(crate) fn terminate(&mut self, cause: Termination) -> Option<Option<Arc<dyn ProducerHandle>>> {
        if self.is_terminal() {
            return None;
        }
        self.state = StreamState::Terminal(cause);
        Some(self.producer.take())
    }

    /// Both halves are done and the record may leave the registry
    pub(crate) fn is_finished(&self) -> bool {
        self.is_terminal() && !self.inbound_open
    }
}

/// One open stream
pub(crate) struct StreamRecord {
    id: StreamId,
    kind: StreamKind,
    inner: Mutex<StreamInner>,
}

impl StreamRecord {
    /// Create a record in the `Idle` state
    pub(crate) fn new(id: StreamId, kind: StreamKind, demand: DemandController, inbound: Option<Arc<Inbound>>) -> Self {
        let inbound_open = inbound.as_ref().map_or(false, |i| i.is_wire_open());
        StreamRecord {
            id,
            kind,
            inner: Mutex::new(StreamInner {
                state: StreamState::Idle,
                demand,
                producer: None,
                inbound,
                inbound_open,
            }),
        }
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn kind(&self) -> StreamKind {
        self.kind
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock()
    }

    pub(crate) fn state(&self) -> StreamState {
        self.inner.lock().state
    }
}

impl fmt::Debug for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Stream registry
///
/// Maps stream ids to records and enforces id uniqueness and the concurrent
/// stream limit.
pub(crate) struct StreamRegistry {
    streams: HashMap<StreamId, Arc<StreamRecord>>,
    max_concurrent_streams: Option<u32>,
}

impl StreamRegistry {
    /// Create an empty registry
    pub(crate) fn new(max_concurrent_streams: Option<u32>) -> Self {
        StreamRegistry {
            streams: HashMap::new(),
            max_concurrent_streams,
        }
    }

    /// Get a record
    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<StreamRecord>> {
        self.streams.get(&id).cloned()
    }

    /// Check if an id is in use
    pub(crate) fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Check if another stream may be opened
    pub(crate) fn has_capacity(&self) -> bool {
        match self.max_concurrent_streams {
            Some(max) => self.streams.len() < max as usize,
            None => true,
        }
    }

    /// Register a new record
    pub(crate) fn insert(&mut self, record: Arc<StreamRecord>) -> Result<()> {
        if self.contains(record.id()) {
            return Err(Error::DuplicateStream(record.id()));
        }
        if !self.has_capacity() {
            // has_capacity is only false when a limit is set
            return Err(Error::TooManyStreams(self.max_concurrent_streams.unwrap_or_default()));
        }

        self.streams.insert(record.id(), record);
        Ok(())
    }

    /// Remove `record` if it is still the one registered under its id
    pub(crate) fn remove_if_same(&mut self, record: &Arc<StreamRecord>) -> bool {
        match self.streams.get(&record.id()) {
            Some(current) if Arc::ptr_eq(current, record) => {
                self.streams.remove(&record.id());
                true
            }
            _ => false,
        }
    }

    /// Remove and return every record
    pub(crate) fn drain(&mut self) -> Vec<Arc<StreamRecord>> {
        self.streams.drain().map(|(_, record)| record).collect()
    }

    /// All records, in no particular order
    pub(crate) fn snapshot(&self) -> Vec<Arc<StreamRecord>> {
        self.streams.values().cloned().collect()
    }

    /// Registered ids, ascending
    pub(crate) fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered streams
    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::Credit;

    fn record(id: StreamId) -> Arc<StreamRecord> {
        Arc::new(StreamRecord::new(
            id,
            StreamKind::RequestStream,
            DemandController::new(Credit::new(1), 256),
            None,
        ))
    }

    #[test]
    fn test_kind_from_frame_type() {
        assert_eq!(
            StreamKind::from_frame_type(FrameType::RequestChannel),
            Some(StreamKind::RequestChannel)
        );
        assert_eq!(
            StreamKind::from_frame_type(FrameType::RequestFnf),
            Some(StreamKind::FireAndForget)
        );
        assert_eq!(StreamKind::from_frame_type(FrameType::Payload), None);
        assert_eq!(StreamKind::RequestStream.to_string(), "Request-Stream");
    }

    #[test]
    fn test_terminate_is_absorbing() {
        let record = record(1);
        let mut inner = record.lock();
        assert_eq!(inner.state, StreamState::Idle);

        assert!(inner.terminate(Termination::Cancelled).is_some());
        assert!(inner.terminate(Termination::Completed).is_none());
        assert_eq!(inner.state, StreamState::Terminal(Termination::Cancelled));
        assert!(inner.is_finished());
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let mut registry = StreamRegistry::new(None);
        registry.insert(record(1)).unwrap();

        let result = registry.insert(record(1));
        assert!(matches!(result, Err(Error::DuplicateStream(1))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_max_concurrent() {
        let mut registry = StreamRegistry::new(Some(2));
        registry.insert(record(1)).unwrap();
        registry.insert(record(3)).unwrap();

        // Third stream should fail
        let result = registry.insert(record(5));
        assert!(matches!(result, Err(Error::TooManyStreams(2))));
        assert!(!registry.has_capacity());
    }

    #[test]
    fn test_remove_is_identity_checked() {
        let mut registry = StreamRegistry::new(None);
        let old = record(7);
        registry.insert(old.clone()).unwrap();
        assert!(registry.remove_if_same(&old));

        // The id is reused by a new stream; the old record must not remove it
        let new = record(7);
        registry.insert(new.clone()).unwrap();
        assert!(!registry.remove_if_same(&old));
        assert!(registry.contains(7));
        assert!(registry.remove_if_same(&new));
        assert!(!registry.contains(7));
    }

    #[test]
    fn test_drain_and_ids() {
        let mut registry = StreamRegistry::new(None);
        for id in [5, 1, 3] {
            registry.insert(record(id)).unwrap();
        }
        assert_eq!(registry.ids(), vec![1, 3, 5]);
        assert_eq!(registry.snapshot().len(), 3);

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.len(), 0);
    }
}
