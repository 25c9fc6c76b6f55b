//! Shared helpers for integration tests
//!
//! `TestConnection` records every frame the server sends and never returns
//! send capacity on its own; tests replenish windows explicitly.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use rsocket_responder::frames::{
    CancelFrame, ErrorFrame, KeepaliveFrame, PayloadFrame, RequestFrame, RequestNFrame,
};
use rsocket_responder::producer::{self, BoxProducer};
use rsocket_responder::{
    DuplexConnection, Error, ErrorCode, Frame, Payload, Producer, ProducerHandle, Responder,
    ResponderError, Result, Server, ServerBuilder, ServerConfig, Sink, StreamId,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory connection recording sent frames
#[derive(Default)]
pub struct TestConnection {
    sent: Mutex<Vec<Frame>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

impl TestConnection {
    /// Frames sent so far
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Frames sent so far, clearing the record
    pub fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Names of the frames sent so far
    pub fn names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(Frame::name).collect()
    }

    /// NEXT-bearing frames sent on a stream
    pub fn next_count(&self, stream_id: StreamId) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|frame| frame.is_next() && frame.stream_id() == stream_id)
            .count()
    }

    /// Make every further send fail
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DuplexConnection for TestConnection {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn receive(&self) -> Result<Option<Frame>> {
        Ok(None)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Errors handed to the server's error sink
#[derive(Clone, Default)]
pub struct ErrorLog(Arc<Mutex<Vec<Error>>>);

impl ErrorLog {
    pub fn push(&self, error: Error) {
        self.0.lock().push(error);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn take(&self) -> Vec<Error> {
        std::mem::take(&mut *self.0.lock())
    }
}

type Handler = Box<dyn Fn(Payload) -> std::result::Result<BoxProducer, ResponderError> + Send + Sync>;
type ChannelHandler =
    Box<dyn Fn(Payload, BoxProducer) -> std::result::Result<BoxProducer, ResponderError> + Send + Sync>;
type Consumer = Box<dyn Fn(Payload) -> std::result::Result<(), ResponderError> + Send + Sync>;
type MetadataConsumer = Box<dyn Fn(Bytes) -> std::result::Result<(), ResponderError> + Send + Sync>;

/// Responder assembled from closures; unset interactions use the defaults
#[derive(Default)]
pub struct TestResponder {
    response: Option<Handler>,
    stream: Option<Handler>,
    channel: Option<ChannelHandler>,
    fire_and_forget: Option<Consumer>,
    metadata_push: Option<MetadataConsumer>,
}

impl TestResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_response<F>(mut self, f: F) -> Self
    where
        F: Fn(Payload) -> std::result::Result<BoxProducer, ResponderError> + Send + Sync + 'static,
    {
        self.response = Some(Box::new(f));
        self
    }

    pub fn on_request_stream<F>(mut self, f: F) -> Self
    where
        F: Fn(Payload) -> std::result::Result<BoxProducer, ResponderError> + Send + Sync + 'static,
    {
        self.stream = Some(Box::new(f));
        self
    }

    pub fn on_request_channel<F>(mut self, f: F) -> Self
    where
        F: Fn(Payload, BoxProducer) -> std::result::Result<BoxProducer, ResponderError> + Send + Sync + 'static,
    {
        self.channel = Some(Box::new(f));
        self
    }

    pub fn on_fire_and_forget<F>(mut self, f: F) -> Self
    where
        F: Fn(Payload) -> std::result::Result<(), ResponderError> + Send + Sync + 'static,
    {
        self.fire_and_forget = Some(Box::new(f));
        self
    }

    pub fn on_metadata_push<F>(mut self, f: F) -> Self
    where
        F: Fn(Bytes) -> std::result::Result<(), ResponderError> + Send + Sync + 'static,
    {
        self.metadata_push = Some(Box::new(f));
        self
    }
}

impl Responder for TestResponder {
    fn request_response(&self, payload: Payload) -> std::result::Result<BoxProducer, ResponderError> {
        match &self.response {
            Some(handler) => handler(payload),
            None => Err(ResponderError::unsupported("Request-Response")),
        }
    }

    fn request_stream(&self, payload: Payload) -> std::result::Result<BoxProducer, ResponderError> {
        match &self.stream {
            Some(handler) => handler(payload),
            None => Err(ResponderError::unsupported("Request-Stream")),
        }
    }

    fn request_channel(
        &self,
        payload: Payload,
        inbound: BoxProducer,
    ) -> std::result::Result<BoxProducer, ResponderError> {
        match &self.channel {
            Some(handler) => handler(payload, inbound),
            None => Err(ResponderError::unsupported("Request-Channel")),
        }
    }

    fn fire_and_forget(&self, payload: Payload) -> std::result::Result<(), ResponderError> {
        match &self.fire_and_forget {
            Some(handler) => handler(payload),
            None => Err(ResponderError::unsupported("Fire-and-Forget")),
        }
    }

    fn metadata_push(&self, metadata: Bytes) -> std::result::Result<(), ResponderError> {
        match &self.metadata_push {
            Some(handler) => handler(metadata),
            None => Err(ResponderError::unsupported("Metadata-Push")),
        }
    }
}

/// Server over a `TestConnection` with the default configuration
pub fn server(responder: TestResponder) -> (Server<TestConnection>, ErrorLog) {
    server_with_config(ServerConfig::default(), responder)
}

/// Server over a `TestConnection`
pub fn server_with_config(config: ServerConfig, responder: TestResponder) -> (Server<TestConnection>, ErrorLog) {
    let errors = ErrorLog::default();
    let sink = errors.clone();
    let server = ServerBuilder::new()
        .config(config)
        .error_sink(move |error| sink.push(error))
        .build(TestConnection::default(), responder);
    (server, errors)
}

/// Producer of an endless sequence of items
pub fn infinite() -> BoxProducer {
    let mut i = 0u64;
    producer::generate(move || {
        i += 1;
        Some(Ok(Payload::from_data(i.to_string())))
    })
}

/// Producer that counts its cancellations
pub fn cancellable(inner: BoxProducer) -> (BoxProducer, Arc<AtomicUsize>) {
    let cancels = Arc::new(AtomicUsize::new(0));
    let counter = cancels.clone();
    let producer = producer::on_cancel(inner, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (producer, cancels)
}

/// Producer that hands its sink to the test
#[derive(Default)]
pub struct Captured {
    sink: Mutex<Option<Arc<dyn Sink>>>,
    requests: Mutex<Vec<u64>>,
    cancelled: AtomicBool,
}

impl Captured {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn producer(self: &Arc<Self>) -> BoxProducer {
        Box::new(CapturedProducer(self.clone()))
    }

    pub fn sink(&self) -> Arc<dyn Sink> {
        self.sink.lock().clone().expect("producer not attached")
    }

    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().clone()
    }

    pub fn demand(&self) -> u64 {
        self.requests.lock().iter().sum()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ProducerHandle for Captured {
    fn request(&self, n: u64) {
        self.requests.lock().push(n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct CapturedProducer(Arc<Captured>);

impl Producer for CapturedProducer {
    fn attach(self: Box<Self>, sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle> {
        *self.0.sink.lock() = Some(sink);
        self.0.clone()
    }
}

/// Sink recording what a producer delivers
#[derive(Default)]
pub struct Collector {
    items: Mutex<Vec<String>>,
    completed: AtomicBool,
    error: Mutex<Option<ResponderError>>,
    handle: Mutex<Option<Arc<dyn ProducerHandle>>>,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach to a producer and keep its handle
    pub fn subscribe(self: &Arc<Self>, producer: BoxProducer) {
        let handle = producer.attach(self.clone());
        *self.handle.lock() = Some(handle);
    }

    pub fn request(&self, n: u64) {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.request(n);
        }
    }

    pub fn cancel(&self) {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    pub fn items(&self) -> Vec<String> {
        self.items.lock().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<ResponderError> {
        self.error.lock().clone()
    }
}

impl Sink for Collector {
    fn next(&self, payload: Payload) {
        let data = String::from_utf8_lossy(payload.data()).into_owned();
        self.items.lock().push(data);
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    fn error(&self, error: ResponderError) {
        *self.error.lock() = Some(error);
    }
}

pub fn request_response(stream_id: StreamId, data: &'static str) -> Frame {
    Frame::RequestResponse(RequestFrame::new(stream_id, Payload::from_data(data)))
}

pub fn request_stream(stream_id: StreamId, n: u32) -> Frame {
    Frame::RequestStream(RequestFrame::new(stream_id, Payload::from_data("request")).with_initial_request_n(n))
}

pub fn request_channel(stream_id: StreamId, n: u32, data: &'static str) -> Frame {
    Frame::RequestChannel(RequestFrame::new(stream_id, Payload::from_data(data)).with_initial_request_n(n))
}

pub fn fire_and_forget(stream_id: StreamId, data: &'static str) -> Frame {
    Frame::RequestFnf(RequestFrame::new(stream_id, Payload::from_data(data)))
}

pub fn request_n(stream_id: StreamId, n: u32) -> Frame {
    Frame::RequestN(RequestNFrame::new(stream_id, n))
}

pub fn cancel(stream_id: StreamId) -> Frame {
    Frame::Cancel(CancelFrame::new(stream_id))
}

pub fn next(stream_id: StreamId, data: &'static str) -> Frame {
    Frame::Payload(PayloadFrame::next(stream_id, Payload::from_data(data)))
}

pub fn complete(stream_id: StreamId) -> Frame {
    Frame::Payload(PayloadFrame::complete(stream_id))
}

pub fn error(stream_id: StreamId, code: ErrorCode, message: &str) -> Frame {
    Frame::Error(ErrorFrame::new(stream_id, code, message))
}

pub fn keepalive(respond: bool, data: &'static str) -> Frame {
    Frame::Keepalive(KeepaliveFrame::new(respond, Bytes::from_static(data.as_bytes())))
}

/// Error frame at `index`, as (code, message)
pub fn error_at(frames: &[Frame], index: usize) -> (Option<ErrorCode>, String) {
    match &frames[index] {
        Frame::Error(error) => (error.error_code(), error.message.clone()),
        other => panic!("expected ERROR frame, got {}", other),
    }
}
