#![forbid(unsafe_code)]

//! Forward references for recursive definitions.
//!
//! A loop is created first, used to build the graph that defines it, then
//! closed over its real source. It must be closed before the transaction it
//! was created in ends; otherwise that transaction reports
//! [`Error::UnresolvedLoop`].
//!
//! ```
//! use natrium_core::{CellLoop, StreamSink, Transaction};
//!
//! let deltas = StreamSink::new();
//! let total = Transaction::run(|| {
//!     let total = CellLoop::new();
//!     let next = deltas
//!         .stream()
//!         .snapshot(&total.cell(), |delta: &i32, sum: &i32| sum + delta)
//!         .hold(0);
//!     total.close(&next).expect("hold breaks the cycle");
//!     next
//! });
//! deltas.send(2);
//! deltas.send(3);
//! assert_eq!(total.sample(), 5);
//! ```

use std::cell::{Cell as StdCell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::graph;
use crate::stream::Stream;
use crate::transaction::{self, Transaction};

/// Placeholder for a stream defined later.
pub struct StreamLoop<T> {
    stream: Stream<T>,
    closed: Rc<StdCell<bool>>,
}

impl<T: Clone + 'static> Default for StreamLoop<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> StreamLoop<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::tracked("stream_loop")
    }

    fn tracked(kind: &'static str) -> Self {
        let closed = Rc::new(StdCell::new(false));
        transaction::track_loop(kind, Rc::clone(&closed));
        Self {
            stream: Stream::placeholder(Rc::clone(&closed)),
            closed,
        }
    }

    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        self.stream.clone()
    }

    /// Define the loop as `source`.
    ///
    /// Fails with [`Error::LoopAlreadyClosed`] on a second call, and with
    /// [`Error::CyclicDependency`] when `source` already depends on this
    /// loop within a single transaction (no `hold` in between).
    pub fn close(&self, source: &Stream<T>) -> Result<()> {
        if self.closed.get() {
            return Err(Error::LoopAlreadyClosed);
        }
        Transaction::run(|| {
            graph::link(source.node_id(), self.stream.node_id())?;
            let source = source.clone();
            let fired = source.peek().is_some();
            self.stream.set_source(move || source.peek());
            self.closed.set(true);
            debug!(node = ?self.stream.node_id(), "loop closed");
            if fired {
                transaction::schedule(self.stream.node_id());
            }
            Ok(())
        })
    }
}

impl<T> fmt::Debug for StreamLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLoop")
            .field("stream", &self.stream)
            .field("closed", &self.closed.get())
            .finish()
    }
}

/// Placeholder for a cell defined later, typically in terms of itself
/// through [`Stream::snapshot`] and [`Stream::hold`].
pub struct CellLoop<T> {
    updates: StreamLoop<T>,
    /// The cell supplied by `close`, sampled for the initial value.
    source: Rc<RefCell<Option<Cell<T>>>>,
    cell: Cell<T>,
}

impl<T: Clone + 'static> Default for CellLoop<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> CellLoop<T> {
    #[must_use]
    pub fn new() -> Self {
        let updates = StreamLoop::tracked("cell_loop");
        let source: Rc<RefCell<Option<Cell<T>>>> = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&source);
        let cell = Cell::lazy("cell_loop", updates.stream(), move || {
            let source = slot.borrow().clone();
            source.ok_or(Error::UnresolvedLoop)?.try_sample()
        });
        Self {
            updates,
            source,
            cell,
        }
    }

    #[must_use]
    pub fn cell(&self) -> Cell<T> {
        self.cell.clone()
    }

    /// Define the loop as `source`. Fails like [`StreamLoop::close`].
    pub fn close(&self, source: &Cell<T>) -> Result<()> {
        Transaction::run(|| {
            self.updates.close(&source.updates())?;
            *self.source.borrow_mut() = Some(source.clone());
            Ok(())
        })
    }
}

impl<T> fmt::Debug for CellLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellLoop")
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}
