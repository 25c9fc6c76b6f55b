//! Credit accounting and demand pacing
//!
//! Two counters bound what a stream may send: the credit the peer granted with
//! the request frame and REQUEST_N frames, and the local window the transport
//! is willing to accept. The demand controller turns both into a pull signal
//! for the response producer so that no more than `min(peer credit, local
//! window)` items are ever requested but not yet sent.

use crate::MAX_REQUEST_N;

/// Saturating credit counter
///
/// Additions clamp at [`Credit::UNBOUNDED`] instead of wrapping. Once a counter
/// is unbounded it stays unbounded: consuming from it does not decrement it.
/// A REQUEST_N value of 2^31-1 is the protocol's way of asking for everything
/// and maps straight to unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit(u64);

impl Credit {
    /// Value representing unbounded credit (`i64::MAX`)
    pub const UNBOUNDED: u64 = i64::MAX as u64;

    /// Create a counter; values at or above `UNBOUNDED` are unbounded
    pub fn new(n: u64) -> Self {
        Credit(n.min(Self::UNBOUNDED))
    }

    /// Create an exhausted counter
    pub fn zero() -> Self {
        Credit(0)
    }

    /// Create an unbounded counter
    pub fn unbounded() -> Self {
        Credit(Self::UNBOUNDED)
    }

    /// Create a counter from a 31-bit request N
    pub fn from_request_n(n: u32) -> Self {
        if n >= MAX_REQUEST_N {
            Self::unbounded()
        } else {
            Credit(n as u64)
        }
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Check if the counter is unbounded
    pub fn is_unbounded(&self) -> bool {
        self.0 == Self::UNBOUNDED
    }

    /// Check if at least one item may be sent
    pub fn has_capacity(&self) -> bool {
        self.0 > 0
    }

    /// Add credit, clamping at `UNBOUNDED`
    ///
    /// Returns the new value.
    pub fn increase(&mut self, n: u64) -> u64 {
        self.0 = self.0.saturating_add(n).min(Self::UNBOUNDED);
        self.0
    }

    /// Add a 31-bit request N
    pub fn increase_request_n(&mut self, n: u32) -> u64 {
        if n >= MAX_REQUEST_N {
            self.0 = Self::UNBOUNDED;
            return self.0;
        }
        self.increase(n as u64)
    }

    /// Consume one unit of credit
    ///
    /// Returns false if there is no credit left.
    pub fn consume(&mut self) -> bool {
        if self.is_unbounded() {
            return true;
        }
        if self.0 == 0 {
            return false;
        }
        self.0 -= 1;
        true
    }
}

impl Default for Credit {
    fn default() -> Self {
        Self::zero()
    }
}

/// Per-stream demand controller
///
/// `outstanding` is what the producer has been asked for and has not yet
/// delivered. The controller maintains `outstanding <= min(peer credit, local
/// window)` at all times and only ever asks for the difference, so a window
/// replenishment of `k` items turns into a pull of at most `k` items.
#[derive(Debug, Clone)]
pub struct DemandController {
    peer_credit: Credit,
    local_window: Credit,
    outstanding: u64,
}

impl DemandController {
    /// Create a controller from the initial peer credit and local window
    pub fn new(peer_credit: Credit, local_window: u64) -> Self {
        DemandController {
            peer_credit,
            local_window: Credit::new(local_window),
            outstanding: 0,
        }
    }

    /// Credit granted by the peer and not yet used
    pub fn peer_credit(&self) -> Credit {
        self.peer_credit
    }

    /// Items the transport currently accepts for this stream
    pub fn local_window(&self) -> Credit {
        self.local_window
    }

    /// Items requested from the producer but not yet delivered
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// Upper bound for `outstanding`
    pub fn permitted(&self) -> u64 {
        self.peer_credit.get().min(self.local_window.get())
    }

    /// Apply a REQUEST_N from the peer
    pub fn grant_peer(&mut self, n: u32) -> u64 {
        self.peer_credit.increase_request_n(n)
    }

    /// Apply a capacity signal from the transport
    pub fn replenish_window(&mut self, n: u64) -> u64 {
        self.local_window.increase(n)
    }

    /// Compute the next pull to issue to the producer
    ///
    /// Returns the additional demand to request, already accounted for in
    /// `outstanding`, or `None` when nothing new is permitted.
    pub fn next_demand(&mut self) -> Option<u64> {
        let permitted = self.permitted();
        if permitted <= self.outstanding {
            return None;
        }

        let demand = permitted - self.outstanding;
        self.outstanding = permitted;
        Some(demand)
    }

    /// Account for one item delivered by the producer
    ///
    /// Returns false if the item was never requested or no credit is left; the
    /// caller must then drop the item instead of sending it.
    pub fn try_emit(&mut self) -> bool {
        if self.outstanding == 0 || !self.peer_credit.has_capacity() || !self.local_window.has_capacity() {
            return false;
        }

        self.peer_credit.consume();
        self.local_window.consume();
        if self.outstanding != Credit::UNBOUNDED {
            self.outstanding -= 1;
        }
        true
    }
}
