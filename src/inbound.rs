//! Inbound half of a request-channel
//!
//! Items the peer sends on a channel are buffered here and handed to the
//! responder as a producer. Demand from the responder is translated into
//! REQUEST_N frames for the peer, so the buffer never holds more than the
//! responder asked for. The request frame's payload is the first item and is
//! covered by the implicit initial credit of one.

use crate::error::{Error, ResponderError, Result};
use crate::flow_control::Credit;
use crate::payload::Payload;
use crate::producer::{BoxProducer, Producer, ProducerHandle, Sink};
use crate::{StreamId, MAX_REQUEST_N};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Engine side of an inbound half
pub(crate) trait InboundOutlet: Send + Sync {
    /// Grant the peer `n` more items
    fn send_request_n(&self, stream_id: StreamId, n: u32);

    /// Tell the peer to stop sending
    fn send_cancel(&self, stream_id: StreamId);

    /// The peer will send nothing more on this half
    fn inbound_closed(&self, stream_id: StreamId, inbound: &Inbound);
}

enum Ending {
    Complete,
    Error(ResponderError),
}

struct InboundState {
    sink: Option<Arc<dyn Sink>>,
    queue: VecDeque<Payload>,
    /// Terminal signal delivered once the queue is empty
    ending: Option<Ending>,
    /// Requested by the responder and not yet delivered
    demand: u64,
    /// Items the peer may still send
    peer_credit: Credit,
    /// Peer may still send frames
    wire_open: bool,
    draining: bool,
    /// Terminal signal delivered or responder cancelled
    finished: bool,
}

/// Buffered inbound half of a channel
pub(crate) struct Inbound {
    stream_id: StreamId,
    outlet: Weak<dyn InboundOutlet>,
    state: Mutex<InboundState>,
}

impl Inbound {
    /// Create the inbound half seeded with the request payload
    pub(crate) fn new(stream_id: StreamId, first: Payload, complete: bool, outlet: Weak<dyn InboundOutlet>) -> Arc<Self> {
        let mut queue = VecDeque::new();
        queue.push_back(first);

        Arc::new(Inbound {
            stream_id,
            outlet,
            state: Mutex::new(InboundState {
                sink: None,
                queue,
                ending: complete.then_some(Ending::Complete),
                demand: 0,
                peer_credit: Credit::zero(),
                wire_open: !complete,
                draining: false,
                finished: false,
            }),
        })
    }

    /// Producer handed to the responder
    pub(crate) fn producer(self: &Arc<Self>) -> BoxProducer {
        Box::new(InboundProducer {
            inbound: Some(self.clone()),
        })
    }

    pub(crate) fn is_wire_open(&self) -> bool {
        self.state.lock().wire_open
    }

    /// Buffered items not yet delivered
    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// NEXT from the peer
    pub(crate) fn on_next(&self, payload: Payload) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.wire_open {
                return Ok(());
            }
            if !state.peer_credit.consume() {
                return Err(Error::Protocol(format!(
                    "Peer sent more items than requested on stream {}",
                    self.stream_id
                )));
            }
            state.queue.push_back(payload);
            if !self.begin_drain(&mut state) {
                return Ok(());
            }
        }
        self.drain();
        Ok(())
    }

    /// COMPLETE from the peer
    pub(crate) fn on_complete(&self) {
        self.close_wire(Ending::Complete, false);
    }

    /// Terminate the half with an error, dropping buffered items
    ///
    /// Used for peer ERROR, peer CANCEL and connection loss. No frame is sent.
    pub(crate) fn fail(&self, error: ResponderError) {
        self.close_wire(Ending::Error(error), true);
    }

    fn close_wire(&self, ending: Ending, discard: bool) {
        let was_open;
        let drain;
        {
            let mut state = self.state.lock();
            if state.finished || state.ending.is_some() {
                return;
            }
            was_open = state.wire_open;
            state.wire_open = false;
            if discard {
                state.queue.clear();
            }
            state.ending = Some(ending);
            drain = self.begin_drain(&mut state);
        }

        if was_open {
            self.notify_closed();
        }
        if drain {
            self.drain();
        }
    }

    fn notify_closed(&self) {
        if let Some(outlet) = self.outlet.upgrade() {
            outlet.inbound_closed(self.stream_id, self);
        }
    }

    /// Claim the drain loop; false if another thread holds it or nobody listens
    fn begin_drain(&self, state: &mut InboundState) -> bool {
        if state.draining || state.sink.is_none() || state.finished {
            return false;
        }
        state.draining = true;
        true
    }

    fn drain(&self) {
        loop {
            let (sink, item) = {
                let mut state = self.state.lock();
                let sink = match (&state.sink, state.finished) {
                    (Some(sink), false) => sink.clone(),
                    _ => {
                        state.draining = false;
                        return;
                    }
                };

                if state.demand > 0 && !state.queue.is_empty() {
                    if state.demand != u64::MAX {
                        state.demand -= 1;
                    }
                    (sink, state.queue.pop_front().map(Ok))
                } else if state.queue.is_empty() && state.ending.is_some() {
                    state.finished = true;
                    state.draining = false;
                    state.sink = None;
                    (sink, state.ending.take().map(Err))
                } else {
                    state.draining = false;
                    return;
                }
            };

            match item {
                Some(Ok(payload)) => sink.next(payload),
                Some(Err(Ending::Complete)) => return sink.complete(),
                Some(Err(Ending::Error(error))) => return sink.error(error),
                None => return,
            }
        }
    }

    /// REQUEST_N to send so that the peer may cover the responder's demand
    fn top_up(&self, state: &mut InboundState) -> Option<u32> {
        if !state.wire_open || state.peer_credit.is_unbounded() {
            return None;
        }

        let wanted = if state.demand == u64::MAX {
            Credit::UNBOUNDED
        } else {
            state.demand.saturating_sub(state.queue.len() as u64)
        };
        let credit = state.peer_credit.get();
        if wanted <= credit {
            return None;
        }

        let n = (wanted - credit).min(MAX_REQUEST_N as u64) as u32;
        state.peer_credit.increase_request_n(n);
        Some(n)
    }
}

impl ProducerHandle for Inbound {
    fn request(&self, n: u64) {
        let request_n;
        let drain;
        {
            let mut state = self.state.lock();
            if state.finished || n == 0 {
                return;
            }
            state.demand = state.demand.saturating_add(n);
            request_n = self.top_up(&mut state);
            drain = self.begin_drain(&mut state);
        }

        if let Some(n) = request_n {
            if let Some(outlet) = self.outlet.upgrade() {
                outlet.send_request_n(self.stream_id, n);
            }
        }
        if drain {
            self.drain();
        }
    }

    fn cancel(&self) {
        let was_open = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.sink = None;
            state.queue.clear();
            state.ending = None;
            std::mem::replace(&mut state.wire_open, false)
        };

        if was_open {
            if let Some(outlet) = self.outlet.upgrade() {
                outlet.send_cancel(self.stream_id);
                outlet.inbound_closed(self.stream_id, self);
            }
        }
    }
}

/// Responder-facing producer over an [`Inbound`]
///
/// Dropping it without attaching cancels the inbound half.
struct InboundProducer {
    inbound: Option<Arc<Inbound>>,
}

impl Producer for InboundProducer {
    fn attach(mut self: Box<Self>, sink: Arc<dyn Sink>) -> Arc<dyn ProducerHandle> {
        let Some(inbound) = self.inbound.take() else {
            return Arc::new(Detached);
        };

        let drain = {
            let mut state = inbound.state.lock();
            if state.finished {
                false
            } else {
                state.sink = Some(sink);
                // An ending that is already known needs no demand
                state.queue.is_empty() && state.ending.is_some() && inbound.begin_drain(&mut state)
            }
        };
        if drain {
            inbound.drain();
        }

        inbound
    }
}

impl Drop for InboundProducer {
    fn drop(&mut self) {
        if let Some(inbound) = self.inbound.take() {
            inbound.cancel();
        }
    }
}

struct Detached;

impl ProducerHandle for Detached {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}
