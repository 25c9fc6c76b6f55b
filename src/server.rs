//! Responder connection
//!
//! [`Server`] owns one connection. It dispatches inbound frames to per-stream
//! state machines, paces each response producer against the peer's credit and
//! the local send window, and tears streams down on cancellation, failure or
//! connection loss.
//!
//! Locking: every stream record has its own lock and the registry has another.
//! A record lock is never held while taking the registry lock, and no lock is
//! held while calling into a producer, the responder or the error sink. Frames
//! for one stream are sent while holding that stream's lock so they reach the
//! connection in emission order.

use crate::codec::{FRAME_HEADER_SIZE, METADATA_LENGTH_SIZE};
use crate::config::ServerConfig;
use crate::connection::DuplexConnection;
use crate::error::{Error, ErrorCode, ResponderError};
use crate::flow_control::{Credit, DemandController};
use crate::frames::{
    CancelFrame, ErrorFrame, Frame, FrameType, KeepaliveFrame, MetadataPushFrame, PayloadFrame,
    RequestFrame, RequestNFrame,
};
use crate::inbound::{Inbound, InboundOutlet};
use crate::payload::{DefaultPayloadFactory, Payload, PayloadFactory};
use crate::producer::{ProducerHandle, Sink};
use crate::responder::{self, Responder};
use crate::stream::{StreamInner, StreamKind, StreamRecord, StreamRegistry, StreamState, Termination};
use crate::{StreamId, CONNECTION_STREAM_ID};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Callback receiving failures the server cannot report to the peer
pub type ErrorSink = Arc<dyn Fn(Error) + Send + Sync>;

/// Send capacity returned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowGrant {
    /// Capacity for one stream
    Stream {
        /// Stream whose window grows
        stream_id: StreamId,
        /// Frames
        n: u64,
    },
    /// Capacity added to every open stream
    Connection {
        /// Frames
        n: u64,
    },
}

trait WindowTarget: Send + Sync {
    fn replenish(&self, grant: WindowGrant);
}

/// Cloneable handle for replenishing send windows from a transport
///
/// Holds no strong reference; grants after the server is gone are ignored.
#[derive(Clone)]
pub struct WindowHandle {
    target: Weak<dyn WindowTarget>,
}

impl WindowHandle {
    /// Apply a grant; returns false if the server no longer exists
    pub fn replenish(&self, grant: WindowGrant) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.replenish(grant);
                true
            }
            None => false,
        }
    }
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    config: ServerConfig,
    payload_factory: Arc<dyn PayloadFactory>,
    error_sink: Option<ErrorSink>,
}

impl ServerBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        ServerBuilder {
            config: ServerConfig::default(),
            payload_factory: Arc::new(DefaultPayloadFactory),
            error_sink: None,
        }
    }

    /// Use a validated configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the factory that builds request payloads
    pub fn payload_factory<F: PayloadFactory + 'static>(mut self, factory: F) -> Self {
        self.payload_factory = Arc::new(factory);
        self
    }

    /// Set the callback for unhandled failures
    ///
    /// Without one, failures are logged at warn level.
    pub fn error_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// Build a server for one connection
    pub fn build<C: DuplexConnection, R: Responder>(self, connection: C, responder: R) -> Server<C> {
        let error_sink = self.error_sink.unwrap_or_else(default_error_sink);

        Server {
            shared: Arc::new(Shared {
                registry: Mutex::new(StreamRegistry::new(self.config.max_concurrent_streams)),
                connection,
                responder: Box::new(responder),
                payload_factory: self.payload_factory,
                error_sink,
                config: self.config,
                disposed: AtomicBool::new(false),
            }),
        }
    }
}

fn default_error_sink() -> ErrorSink {
    Arc::new(|error: Error| warn!(error = %error, "Unhandled connection error"))
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Responder side of one connection
///
/// Frames are fed either by [`Server::serve`] or by the host calling
/// [`Server::handle_frame`] from a single thread. Producers may deliver items
/// from any thread. Dropping the server disposes it.
pub struct Server<C: DuplexConnection> {
    shared: Arc<Shared<C>>,
}

impl<C: DuplexConnection> Server<C> {
    /// Dispatch one inbound frame
    pub fn handle_frame(&self, frame: Frame) {
        self.shared.handle_frame(frame);
    }

    /// Handle a failure reported by the receive side of the connection
    pub fn handle_receive_error(&self, error: Error) {
        self.shared.handle_receive_error(error);
    }

    /// Receive and dispatch frames until the connection ends
    pub fn serve(&self) {
        debug!("Serving connection");
        while !self.shared.is_disposed() {
            match self.shared.connection.receive() {
                Ok(Some(frame)) => self.shared.handle_frame(frame),
                Ok(None) => {
                    debug!("Connection closed by peer");
                    self.shared.dispose();
                }
                Err(error) => {
                    let fatal = error.is_connection_fatal();
                    self.shared.handle_receive_error(error);
                    if fatal {
                        break;
                    }
                }
            }
        }
    }

    /// Grow send windows
    pub fn replenish_window(&self, grant: WindowGrant) {
        self.shared.grant_window(grant);
    }

    /// Handle for transports that report send capacity
    pub fn window_handle(&self) -> WindowHandle {
        let target: Weak<dyn WindowTarget> = Arc::downgrade(&self.shared) as Weak<dyn WindowTarget>;
        WindowHandle { target }
    }

    /// Terminate every stream without frames and close the connection
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// Check if the server was disposed or the connection failed
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Ids of registered streams, ascending
    pub fn active_streams(&self) -> Vec<StreamId> {
        self.shared.registry.lock().ids()
    }

    /// State of a registered stream
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        let record = self.shared.registry.lock().get(stream_id);
        record.map(|record| record.state())
    }

    /// Underlying connection
    pub fn connection(&self) -> &C {
        &self.shared.connection
    }

    /// Active configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl<C: DuplexConnection> Drop for Server<C> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

/// Side effects computed under a record lock and applied after releasing it
#[derive(Default)]
struct Outcome {
    send_error: Option<Error>,
    request: Option<(Arc<dyn ProducerHandle>, u64)>,
    cancel: Option<Arc<dyn ProducerHandle>>,
    inbound: Option<(Arc<Inbound>, ResponderError)>,
    finished: bool,
}

struct Shared<C: DuplexConnection> {
    connection: C,
    responder: Box<dyn Responder>,
    payload_factory: Arc<dyn PayloadFactory>,
    error_sink: ErrorSink,
    config: ServerConfig,
    registry: Mutex<StreamRegistry>,
    disposed: AtomicBool,
}

impl<C: DuplexConnection> Shared<C> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn report(&self, error: Error) {
        debug!(error = %error, "Reporting error");
        (self.error_sink)(error);
    }

    /// Send outside any record lock
    fn send(&self, frame: Frame) {
        if let Err(error) = self.connection.send(frame) {
            self.fail_connection(error);
        }
    }

    fn payload(&self, payload: Payload) -> Payload {
        let (metadata, data) = payload.into_parts();
        self.payload_factory.create(metadata, data)
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        if self.is_disposed() {
            trace!(frame = %frame, "Ignoring frame on disposed connection");
            return;
        }
        trace!(frame = %frame, "Dispatching frame");

        match frame {
            Frame::Setup(_) => {
                self.report(Error::Protocol("SETUP frame on an established connection".to_string()))
            }
            Frame::Keepalive(keepalive) => self.handle_keepalive(keepalive),
            Frame::RequestResponse(request) => self.handle_request(StreamKind::RequestResponse, request),
            Frame::RequestStream(request) => self.handle_request(StreamKind::RequestStream, request),
            Frame::RequestChannel(request) => self.handle_request(StreamKind::RequestChannel, request),
            Frame::RequestFnf(request) => self.handle_fire_and_forget(request),
            Frame::RequestN(request_n) => self.handle_request_n(request_n),
            Frame::Cancel(cancel) => self.handle_cancel(cancel),
            Frame::Payload(payload) => self.handle_payload(payload),
            Frame::Error(error) => self.handle_error(error),
            Frame::MetadataPush(push) => self.handle_metadata_push(push),
        }
    }

    fn handle_keepalive(&self, keepalive: KeepaliveFrame) {
        if keepalive.respond {
            debug!(len = keepalive.data.len(), "Answering KEEPALIVE");
            self.send(Frame::Keepalive(keepalive.reply()));
        } else {
            trace!("KEEPALIVE received");
        }
    }

    fn handle_request(self: &Arc<Self>, kind: StreamKind, request: RequestFrame) {
        let stream_id = request.stream_id;
        if stream_id == CONNECTION_STREAM_ID {
            return self.report(Error::InvalidFrame {
                stream_id,
                reason: format!("{} request on the connection stream", kind),
            });
        }
        if self.registry.lock().contains(stream_id) {
            return self.report(Error::DuplicateStream(stream_id));
        }
        if request.follows {
            self.send(Frame::Error(ErrorFrame::new(
                stream_id,
                ErrorCode::Invalid,
                "Fragmentation is not supported",
            )));
            return self.report(Error::InvalidFrame {
                stream_id,
                reason: "fragmented request".to_string(),
            });
        }

        let payload = self.payload(request.payload);
        let peer_credit = match kind {
            StreamKind::RequestResponse => Credit::new(1),
            _ => Credit::from_request_n(request.initial_request_n),
        };
        let demand = DemandController::new(peer_credit, self.config.initial_send_window);
        let inbound = (kind == StreamKind::RequestChannel)
            .then(|| Inbound::new(stream_id, payload.clone(), request.complete, self.outlet()));
        let record = Arc::new(StreamRecord::new(stream_id, kind, demand, inbound.clone()));

        let inserted = self.registry.lock().insert(record.clone());
        match inserted {
            Ok(()) => {}
            Err(Error::TooManyStreams(limit)) => {
                warn!(stream_id, limit, "Rejecting request over the concurrent stream limit");
                self.send(Frame::Error(ErrorFrame::new(
                    stream_id,
                    ErrorCode::Rejected,
                    format!("Too many concurrent streams (limit {})", limit),
                )));
                return;
            }
            Err(error) => return self.report(error),
        }
        debug!(stream_id, kind = %kind, credit = peer_credit.get(), "Stream opened");

        let sink = Arc::new(StreamSink {
            shared: self.clone(),
            record: record.clone(),
        });

        let inbound = inbound.map(|inbound| inbound.producer());
        let producer = responder::invoke(|| match (kind, inbound) {
            (StreamKind::RequestChannel, Some(inbound)) => self.responder.request_channel(payload, inbound),
            (StreamKind::RequestStream, _) => self.responder.request_stream(payload),
            _ => self.responder.request_response(payload),
        });

        match producer {
            Ok(producer) => {
                let handle = producer.attach(sink);
                self.activate(&record, handle);
            }
            Err(error) => {
                debug!(stream_id, error = %error, "Responder rejected request");
                sink.error(error);
            }
        }
    }

    /// Store the attached producer and issue its first demand
    fn activate(&self, record: &Arc<StreamRecord>, handle: Arc<dyn ProducerHandle>) {
        let outcome = {
            let mut inner = record.lock();
            let state = inner.state;
            match state {
                StreamState::Terminal(Termination::Completed | Termination::Errored) => Outcome::default(),
                StreamState::Terminal(_) => Outcome {
                    cancel: Some(handle),
                    ..Outcome::default()
                },
                _ => {
                    inner.state = StreamState::Demanding;
                    inner.producer = Some(handle);
                    Outcome {
                        request: pull(&mut inner),
                        ..Outcome::default()
                    }
                }
            }
        };
        self.apply(record, outcome);
    }

    fn handle_fire_and_forget(&self, request: RequestFrame) {
        let stream_id = request.stream_id;
        if stream_id == CONNECTION_STREAM_ID {
            return self.report(Error::InvalidFrame {
                stream_id,
                reason: "Fire-and-Forget request on the connection stream".to_string(),
            });
        }

        let (open, has_capacity) = {
            let registry = self.registry.lock();
            (registry.contains(stream_id), registry.has_capacity())
        };
        if open {
            return self.report(Error::DuplicateStream(stream_id));
        }
        if request.follows {
            return self.report(Error::InvalidFrame {
                stream_id,
                reason: "fragmented request".to_string(),
            });
        }
        if !has_capacity {
            debug!(stream_id, "Dropping Fire-and-Forget over the concurrent stream limit");
            return;
        }

        trace!(stream_id, "Fire-and-Forget");
        let payload = self.payload(request.payload);
        if let Err(error) = responder::invoke(|| self.responder.fire_and_forget(payload)) {
            debug!(stream_id, error = %error, "Fire-and-Forget failed");
        }
    }

    fn handle_metadata_push(&self, push: MetadataPushFrame) {
        trace!(len = push.metadata.len(), "METADATA_PUSH received");
        if let Err(error) = responder::invoke(|| self.responder.metadata_push(push.metadata)) {
            self.report(Error::Responder(error));
        }
    }

    /// Get an open stream or report the frame as a protocol violation
    fn lookup(&self, stream_id: StreamId, frame_type: FrameType) -> Option<Arc<StreamRecord>> {
        let record = self.registry.lock().get(stream_id);
        if record.is_none() {
            self.report(Error::UnknownStream { stream_id, frame_type });
        }
        record
    }

    fn handle_request_n(&self, frame: RequestNFrame) {
        let Some(record) = self.lookup(frame.stream_id, FrameType::RequestN) else {
            return;
        };

        let outcome = {
            let mut inner = record.lock();
            if inner.is_terminal() {
                trace!(stream_id = frame.stream_id, "REQUEST_N for terminated stream ignored");
                return;
            }
            let credit = inner.demand.grant_peer(frame.request_n);
            trace!(stream_id = frame.stream_id, n = frame.request_n, credit, "REQUEST_N received");
            Outcome {
                request: pull(&mut inner),
                ..Outcome::default()
            }
        };
        self.apply(&record, outcome);
    }

    fn handle_cancel(&self, frame: CancelFrame) {
        let stream_id = frame.stream_id;
        let record = self.registry.lock().get(stream_id);
        let Some(record) = record else {
            trace!(stream_id, "CANCEL for unknown stream ignored");
            return;
        };

        let outcome = {
            let mut inner = record.lock();
            let released = inner.terminate(Termination::Cancelled);
            if released.is_some() {
                debug!(stream_id, "Stream cancelled by peer");
            }
            Outcome {
                cancel: released.flatten(),
                inbound: inner
                    .inbound
                    .clone()
                    .map(|inbound| (inbound, ResponderError::canceled("Stream cancelled by peer"))),
                finished: inner.is_finished(),
                ..Outcome::default()
            }
        };
        self.apply(&record, outcome);
    }

    fn handle_payload(&self, frame: PayloadFrame) {
        let stream_id = frame.stream_id;
        let Some(record) = self.lookup(stream_id, FrameType::Payload) else {
            return;
        };

        let inbound = record.lock().inbound.clone();
        let Some(inbound) = inbound else {
            return self.report(Error::InvalidFrame {
                stream_id,
                reason: format!("PAYLOAD frame on a {} stream", record.kind()),
            });
        };

        if frame.next {
            if let Err(error) = inbound.on_next(self.payload(frame.payload)) {
                self.report(error);
            }
        }
        if frame.complete {
            trace!(stream_id, "Inbound half completed by peer");
            inbound.on_complete();
        }
    }

    fn handle_error(&self, frame: ErrorFrame) {
        let stream_id = frame.stream_id;
        if stream_id == CONNECTION_STREAM_ID {
            let code = frame.error_code().unwrap_or(ErrorCode::ConnectionError);
            return self.fail_connection(Error::ConnectionError {
                code,
                message: frame.message,
            });
        }

        let Some(record) = self.lookup(stream_id, FrameType::Error) else {
            return;
        };
        let code = frame
            .error_code()
            .filter(|code| !code.is_connection_level())
            .unwrap_or(ErrorCode::ApplicationError);

        let outcome = {
            let mut inner = record.lock();
            let released = inner.terminate(Termination::PeerError);
            debug!(stream_id, code = frame.code, message = %frame.message, "Stream terminated by peer error");
            Outcome {
                cancel: released.flatten(),
                inbound: inner
                    .inbound
                    .clone()
                    .map(|inbound| (inbound, ResponderError::new(code, frame.message.clone()))),
                finished: inner.is_finished(),
                ..Outcome::default()
            }
        };
        self.apply(&record, outcome);
    }

    fn handle_receive_error(&self, error: Error) {
        if error.is_connection_fatal() {
            return self.fail_connection(error);
        }

        if let Error::InvalidFrame { stream_id, reason } = &error {
            let record = match *stream_id {
                CONNECTION_STREAM_ID => None,
                id => self.registry.lock().get(id),
            };
            if let Some(record) = record {
                let outcome = {
                    let mut inner = record.lock();
                    match inner.terminate(Termination::Errored) {
                        Some(released) => Outcome {
                            send_error: self
                                .connection
                                .send(Frame::Error(ErrorFrame::new(*stream_id, ErrorCode::Invalid, reason.clone())))
                                .err(),
                            cancel: released,
                            inbound: inner
                                .inbound
                                .clone()
                                .map(|inbound| (inbound, ResponderError::invalid(reason.clone()))),
                            finished: inner.is_finished(),
                            ..Outcome::default()
                        },
                        None => Outcome::default(),
                    }
                };
                self.apply(&record, outcome);
            }
        }

        self.report(error);
    }

    fn grant_window(&self, grant: WindowGrant) {
        match grant {
            WindowGrant::Stream { stream_id, n } => {
                let record = self.registry.lock().get(stream_id);
                if let Some(record) = record {
                    self.replenish_stream(&record, n);
                }
            }
            WindowGrant::Connection { n } => {
                let records = self.registry.lock().snapshot();
                for record in records {
                    self.replenish_stream(&record, n);
                }
            }
        }
    }

    fn replenish_stream(&self, record: &Arc<StreamRecord>, n: u64) {
        let outcome = {
            let mut inner = record.lock();
            if inner.is_terminal() {
                return;
            }
            let window = inner.demand.replenish_window(n);
            trace!(stream_id = record.id(), n, window, "Send window replenished");
            Outcome {
                request: pull(&mut inner),
                ..Outcome::default()
            }
        };
        self.apply(record, outcome);
    }

    /// Carry out the side effects of a state change, in a fixed order
    ///
    /// The inbound half is closed before the producer is cancelled, so a
    /// producer built on the inbound half finds the wire already closed and
    /// sends no CANCEL.
    fn apply(&self, record: &Arc<StreamRecord>, outcome: Outcome) {
        if let Some((inbound, error)) = outcome.inbound {
            inbound.fail(error);
        }
        if let Some(handle) = outcome.cancel {
            handle.cancel();
        }
        if outcome.finished {
            self.remove(record);
        }
        if let Some((handle, n)) = outcome.request {
            trace!(stream_id = record.id(), n, "Requesting items");
            handle.request(n);
        }
        if let Some(error) = outcome.send_error {
            self.fail_connection(error);
        }
    }

    fn remove(&self, record: &Arc<StreamRecord>) {
        let removed = self.registry.lock().remove_if_same(record);
        if removed {
            debug!(stream_id = record.id(), state = ?record.state(), "Stream closed");
        }
    }

    fn fail_connection(&self, error: Error) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            trace!(error = %error, "Connection already disposed");
            return;
        }
        warn!(error = %error, "Connection failed");
        self.report(error);
        self.terminate_all();
        self.connection.close();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Disposing connection");
        self.terminate_all();
        self.connection.close();
    }

    fn terminate_all(&self) {
        let records = self.registry.lock().drain();
        let count = records.len();

        for record in records {
            let (released, inbound) = {
                let mut inner = record.lock();
                (inner.terminate(Termination::ConnectionLost).flatten(), inner.inbound.clone())
            };
            if let Some(inbound) = inbound {
                inbound.fail(ResponderError::new(ErrorCode::ConnectionError, "Connection closed"));
            }
            if let Some(handle) = released {
                handle.cancel();
            }
        }
        debug!(streams = count, "Terminated open streams");
    }

    fn outlet(self: &Arc<Self>) -> Weak<dyn InboundOutlet> {
        Arc::downgrade(self) as Weak<dyn InboundOutlet>
    }
}

/// Next pull for an attached producer
fn pull(inner: &mut StreamInner) -> Option<(Arc<dyn ProducerHandle>, u64)> {
    let handle = inner.producer.clone()?;
    inner.demand.next_demand().map(|n| (handle, n))
}

impl<C: DuplexConnection> WindowTarget for Shared<C> {
    fn replenish(&self, grant: WindowGrant) {
        self.grant_window(grant);
    }
}

impl<C: DuplexConnection> InboundOutlet for Shared<C> {
    fn send_request_n(&self, stream_id: StreamId, n: u32) {
        trace!(stream_id, n, "Requesting inbound items from peer");
        self.send(Frame::RequestN(RequestNFrame::new(stream_id, n)));
    }

    fn send_cancel(&self, stream_id: StreamId) {
        debug!(stream_id, "Inbound half cancelled by responder");
        self.send(Frame::Cancel(CancelFrame::new(stream_id)));
    }

    fn inbound_closed(&self, stream_id: StreamId, inbound: &Inbound) {
        let record = self.registry.lock().get(stream_id);
        let Some(record) = record else {
            return;
        };

        let finished = {
            let mut inner = record.lock();
            let same = inner
                .inbound
                .as_ref()
                .map_or(false, |current| std::ptr::eq(Arc::as_ptr(current), inbound));
            if !same {
                return;
            }
            inner.inbound_open = false;
            inner.is_finished()
        };
        if finished {
            self.remove(&record);
        }
    }
}

/// Delivery target attached to a response producer
struct StreamSink<C: DuplexConnection> {
    shared: Arc<Shared<C>>,
    record: Arc<StreamRecord>,
}

impl<C: DuplexConnection> StreamSink<C> {
    fn terminate_with_error(&self, error: ResponderError, cancel_producer: bool) {
        let stream_id = self.record.id();
        // Connection-level codes are not allowed on a stream
        let code = if error.code().is_connection_level() {
            ErrorCode::ApplicationError
        } else {
            error.code()
        };

        let outcome = {
            let mut inner = self.record.lock();
            let Some(released) = inner.terminate(Termination::Errored) else {
                trace!(stream_id, "Ignoring error for terminated stream");
                return;
            };
            debug!(stream_id, error = %error, "Stream failed");
            let sent = self
                .shared
                .connection
                .send(Frame::Error(ErrorFrame::new(stream_id, code, error.message())));
            Outcome {
                send_error: sent.err(),
                cancel: released.filter(|_| cancel_producer),
                inbound: inner.inbound.clone().map(|inbound| (inbound, error)),
                finished: inner.is_finished(),
                ..Outcome::default()
            }
        };
        self.shared.apply(&self.record, outcome);
    }

    fn exceeds_frame_length(&self, payload: &Payload) -> bool {
        let metadata = if payload.has_metadata() { METADATA_LENGTH_SIZE } else { 0 };
        FRAME_HEADER_SIZE + metadata + payload.len() > self.shared.config.max_frame_length
    }
}

impl<C: DuplexConnection> Sink for StreamSink<C> {
    fn next(&self, payload: Payload) {
        let stream_id = self.record.id();
        if self.exceeds_frame_length(&payload) {
            let error = ResponderError::application(format!(
                "Payload of {} bytes exceeds maximum frame length {}",
                payload.len(),
                self.shared.config.max_frame_length
            ));
            return self.terminate_with_error(error, true);
        }

        let outcome = {
            let mut inner = self.record.lock();
            if inner.is_terminal() {
                trace!(stream_id, "Dropping item for terminated stream");
                return;
            }
            if !inner.demand.try_emit() {
                warn!(stream_id, "Producer emitted more items than requested; item dropped");
                return;
            }

            if self.record.kind() == StreamKind::RequestResponse {
                let sent = self
                    .shared
                    .connection
                    .send(Frame::Payload(PayloadFrame::next_complete(stream_id, payload)));
                let released = inner.terminate(Termination::Completed).flatten();
                Outcome {
                    send_error: sent.err(),
                    cancel: released,
                    finished: inner.is_finished(),
                    ..Outcome::default()
                }
            } else {
                let sent = self
                    .shared
                    .connection
                    .send(Frame::Payload(PayloadFrame::next(stream_id, payload)));
                Outcome {
                    send_error: sent.err(),
                    request: pull(&mut inner),
                    ..Outcome::default()
                }
            }
        };
        self.shared.apply(&self.record, outcome);
    }

    fn complete(&self) {
        let stream_id = self.record.id();
        let outcome = {
            let mut inner = self.record.lock();
            if inner.terminate(Termination::Completed).is_none() {
                trace!(stream_id, "Ignoring completion for terminated stream");
                return;
            }
            debug!(stream_id, "Stream completed");
            let sent = self
                .shared
                .connection
                .send(Frame::Payload(PayloadFrame::complete(stream_id)));
            Outcome {
                send_error: sent.err(),
                finished: inner.is_finished(),
                ..Outcome::default()
            }
        };
        self.shared.apply(&self.record, outcome);
    }

    fn error(&self, error: ResponderError) {
        self.terminate_with_error(error, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfigBuilder;
    use crate::producer::{self, BoxProducer};

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Frame>>,
    }

    impl DuplexConnection for Recording {
        fn send(&self, frame: Frame) -> crate::Result<()> {
            self.sent.lock().push(frame);
            Ok(())
        }

        fn receive(&self) -> crate::Result<Option<Frame>> {
            Ok(None)
        }

        fn close(&self) {}
    }

    struct Numbers;

    impl Responder for Numbers {
        fn request_stream(&self, _payload: Payload) -> Result<BoxProducer, ResponderError> {
            Ok(producer::from_iter((0..3).map(|i| Payload::from_data(i.to_string()))))
        }
    }

    fn request_stream(stream_id: StreamId, n: u32) -> Frame {
        Frame::RequestStream(RequestFrame::new(stream_id, Payload::empty()).with_initial_request_n(n))
    }

    #[test]
    fn test_stream_paced_by_peer_credit() {
        let server = ServerBuilder::new().build(Recording::default(), Numbers);
        server.handle_frame(request_stream(1, 2));

        assert_eq!(server.connection().sent.lock().len(), 2);
        assert_eq!(server.stream_state(1), Some(StreamState::Demanding));

        server.handle_frame(Frame::RequestN(RequestNFrame::new(1, 2)));
        let sent = server.connection().sent.lock().clone();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].name(), "COMPLETE");
        assert!(server.active_streams().is_empty());
    }

    #[test]
    fn test_stream_paced_by_local_window() {
        let config = ServerConfigBuilder::new().initial_send_window(1).build().unwrap();
        let server = ServerBuilder::new()
            .config(config)
            .build(Recording::default(), Numbers);
        server.handle_frame(request_stream(1, crate::MAX_REQUEST_N));
        assert_eq!(server.connection().sent.lock().len(), 1);

        server.replenish_window(WindowGrant::Stream { stream_id: 1, n: 1 });
        assert_eq!(server.connection().sent.lock().len(), 2);

        let handle = server.window_handle();
        assert!(handle.replenish(WindowGrant::Connection { n: 5 }));
        let sent = server.connection().sent.lock().clone();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].name(), "COMPLETE");

        drop(server);
        assert!(!handle.replenish(WindowGrant::Connection { n: 1 }));
    }

    #[test]
    fn test_oversized_item_fails_stream() {
        struct Big;

        impl Responder for Big {
            fn request_response(&self, _payload: Payload) -> Result<BoxProducer, ResponderError> {
                Ok(producer::once(Payload::from_data(vec![0u8; 64])))
            }
        }

        let config = ServerConfigBuilder::new().max_frame_length(32).build().unwrap();
        let server = ServerBuilder::new().config(config).build(Recording::default(), Big);
        server.handle_frame(Frame::RequestResponse(RequestFrame::new(1, Payload::empty())));

        let sent = server.connection().sent.lock().clone();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Frame::Error(error) => assert_eq!(error.error_code(), Some(ErrorCode::ApplicationError)),
            other => panic!("unexpected frame {}", other),
        }
        assert!(server.active_streams().is_empty());
    }
}
