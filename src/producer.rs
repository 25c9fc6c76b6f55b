//! Pull-based producers
//!
//! A responder answers a request with a [`Producer`]. The engine attaches a
//! [`Sink`] to it and gets back a [`ProducerHandle`] through which it pulls
//! items (`request(n)`) or stops the producer (`cancel()`). The producer
//! delivers items, completion or failure to the sink from whatever thread it
//! runs on.
//!
//! Contract for implementors:
//!
//! - Never deliver more items than the sum of all `request(n)` calls. The engine
//!   drops items beyond that.
//! - `request` and `cancel` may be called from inside `Sink::next`. Both must
//!   return without waiting for delivery to finish.
//! - `cancel` is idempotent. After it returns no further signal is required,
//!   and signals that race with it are ignored by the engine.
//! - Completion and failure may be signalled without outstanding demand.

use crate::error::ResponderError;
use crate::payload::Payload;
use parking_lot::Mutex;
use std::iter::Peekable;
use std::sync::Arc;

/// Owned, type-erased producer
pub type BoxProducer = Box<dyn Producer>;

/// A source of response items
pub trait Producer: Send + 'static {
    /// Attach the sink that receives this producer's signals
    fn attach(self: Box<Self>, sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle>;
}

/// Receiver of a producer's signals
pub trait Sink: Send + Sync {
    /// One item
    fn next(&self, payload: Payload);

    /// No more items
    fn complete(&self);

    /// Producer failed; no more items
    fn error(&self, error: ResponderError);
}

/// Control side of an attached producer
pub trait ProducerHandle: Send + Sync {
    /// Ask for `n` more items; demand is additive and saturates
    fn request(&self, n: u64);

    /// Stop producing and release resources
    fn cancel(&self);
}

/// Handle for producers that have nothing left to control
struct Inert;

impl ProducerHandle for Inert {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Producer that completes immediately
pub fn empty() -> BoxProducer {
    Box::new(Immediate(None))
}

/// Producer that fails immediately
pub fn failed(error: ResponderError) -> BoxProducer {
    Box::new(Immediate(Some(error)))
}

struct Immediate(Option<ResponderError>);

impl Producer for Immediate {
    fn attach(self: Box<Self>, sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle> {
        match self.0 {
            Some(error) => sink.error(error),
            None => sink.complete(),
        }
        Arc::new(Inert)
    }
}

/// Producer that never signals anything
pub fn never() -> BoxProducer {
    Box::new(Never)
}

struct Never;

impl Producer for Never {
    fn attach(self: Box<Self>, _sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle> {
        Arc::new(Inert)
    }
}

/// Producer of a single item
///
/// Completes together with the item, so one unit of demand is enough.
pub fn once(payload: Payload) -> BoxProducer {
    from_iter(std::iter::once(payload))
}

/// Producer of every item of an iterator, then completion
///
/// The iterator is looked ahead by one item so the last item is followed by
/// completion without further demand.
pub fn from_iter<I>(items: I) -> BoxProducer
where
    I: IntoIterator<Item = Payload>,
    I::IntoIter: Send + 'static,
{
    Box::new(Generate {
        source: IterSource(items.into_iter().peekable()),
    })
}

/// Producer driven by a generator function
///
/// The generator is called once per requested item. `Some(Ok(_))` is an item,
/// `Some(Err(_))` fails the producer and `None` completes it. Items are
/// generated on the thread that issues demand.
pub fn generate<F>(source: F) -> BoxProducer
where
    F: FnMut() -> Option<Result<Payload, ResponderError>> + Send + 'static,
{
    Box::new(Generate {
        source: FnSource(source),
    })
}

/// One pull from a generated sequence
enum Step {
    Item(Payload),
    /// Final item; completion follows without further demand
    Last(Payload),
    Done,
    Failed(ResponderError),
}

trait Source: Send + 'static {
    fn step(&mut self) -> Step;
}

struct FnSource<F>(F);

impl<F> Source for FnSource<F>
where
    F: FnMut() -> Option<Result<Payload, ResponderError>> + Send + 'static,
{
    fn step(&mut self) -> Step {
        match (self.0)() {
            Some(Ok(payload)) => Step::Item(payload),
            Some(Err(error)) => Step::Failed(error),
            None => Step::Done,
        }
    }
}

struct IterSource<I: Iterator>(Peekable<I>);

impl<I> Source for IterSource<I>
where
    I: Iterator<Item = Payload> + Send + 'static,
{
    fn step(&mut self) -> Step {
        match self.0.next() {
            Some(payload) if self.0.peek().is_none() => Step::Last(payload),
            Some(payload) => Step::Item(payload),
            None => Step::Done,
        }
    }
}

struct Generate<S> {
    source: S,
}

impl<S: Source> Producer for Generate<S> {
    fn attach(self: Box<Self>, sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle> {
        Arc::new(GenerateHandle {
            sink,
            state: Mutex::new(GenerateState {
                source: Some(self.source),
                demand: 0,
                draining: false,
                finished: false,
            }),
        })
    }
}

struct GenerateState<S> {
    /// Taken out while the generator runs; gone after the last item
    source: Option<S>,
    demand: u64,
    /// Some thread is inside `drain`
    draining: bool,
    /// Completed, failed or cancelled
    finished: bool,
}

struct GenerateHandle<S> {
    sink: Arc<dyn Sink>,
    state: Mutex<GenerateState<S>>,
}

impl<S: Source> GenerateHandle<S> {
    fn drain(&self) {
        loop {
            let mut source = {
                let mut state = self.state.lock();
                if state.finished || state.demand == 0 {
                    state.draining = false;
                    return;
                }
                match state.source.take() {
                    Some(source) => {
                        if state.demand != u64::MAX {
                            state.demand -= 1;
                        }
                        source
                    }
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            let step = source.step();

            {
                let mut state = self.state.lock();
                if state.finished {
                    state.draining = false;
                    return;
                }
                match step {
                    Step::Item(_) => state.source = Some(source),
                    // Still draining until completion is delivered
                    Step::Last(_) => {}
                    Step::Done | Step::Failed(_) => {
                        state.finished = true;
                        state.draining = false;
                    }
                }
            }

            match step {
                Step::Item(payload) => self.sink.next(payload),
                Step::Last(payload) => {
                    self.sink.next(payload);
                    return self.complete_after_last();
                }
                Step::Done => return self.sink.complete(),
                Step::Failed(error) => return self.sink.error(error),
            }
        }
    }

    fn complete_after_last(&self) {
        {
            let mut state = self.state.lock();
            state.draining = false;
            // Cancelled from inside `next`
            if state.finished {
                return;
            }
            state.finished = true;
        }
        self.sink.complete();
    }
}

impl<S: Source> ProducerHandle for GenerateHandle<S> {
    fn request(&self, n: u64) {
        {
            let mut state = self.state.lock();
            if state.finished || n == 0 {
                return;
            }
            state.demand = state.demand.saturating_add(n);
            if state.draining {
                return;
            }
            state.draining = true;
        }
        self.drain();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        state.demand = 0;
        state.source = None;
    }
}

/// Observe every demand signal issued to a producer
pub fn on_request<H>(producer: BoxProducer, hook: H) -> BoxProducer
where
    H: Fn(u64) + Send + Sync + 'static,
{
    Box::new(Hooked {
        inner: producer,
        on_request: Some(Arc::new(hook)),
        on_cancel: None,
    })
}

/// Observe cancellation of a producer
pub fn on_cancel<H>(producer: BoxProducer, hook: H) -> BoxProducer
where
    H: Fn() + Send + Sync + 'static,
{
    Box::new(Hooked {
        inner: producer,
        on_request: None,
        on_cancel: Some(Arc::new(hook)),
    })
}

struct Hooked {
    inner: BoxProducer,
    on_request: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Producer for Hooked {
    fn attach(self: Box<Self>, sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle> {
        let inner = self.inner.attach(sink);
        Arc::new(HookedHandle {
            inner,
            on_request: self.on_request,
            on_cancel: self.on_cancel,
        })
    }
}

struct HookedHandle {
    inner: Arc<dyn ProducerHandle>,
    on_request: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ProducerHandle for HookedHandle {
    fn request(&self, n: u64) {
        if let Some(hook) = &self.on_request {
            hook(n);
        }
        self.inner.request(n);
    }

    fn cancel(&self) {
        if let Some(hook) = &self.on_cancel {
            hook();
        }
        self.inner.cancel();
    }
}
