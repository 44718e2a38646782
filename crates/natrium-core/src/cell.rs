#![forbid(unsafe_code)]

//! Time-varying values.
//!
//! A [`Cell`] always has a committed value. Its changes arrive through the
//! [`Cell::updates`] stream and become visible to [`Cell::sample`] only when
//! the transaction that produced them commits.
//!
//! # Invariants
//!
//! 1. `sample()` never observes a value produced by the transaction that is
//!    currently open.
//! 2. Combinators that read several cells ([`Cell::lift2`], [`Cell::lift3`],
//!    [`Cell::lift_all`], [`Cell::switch_c`]) read every input at its value
//!    for *this* transaction, so no firing mixes stale and fresh inputs.
//! 3. Derived cells compute their initial value lazily, on first sample, so
//!    cells built on an unclosed loop can be constructed before the loop is
//!    closed.

use std::cell::{Cell as StdCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{self, NodeGuard, NodeId, Vertex};
use crate::listener::Listener;
use crate::stream::{self, Stream};
use crate::transaction::{self, Transaction};

type Lazy<T> = Rc<dyn Fn() -> Result<T>>;

/// Function value held by a cell, as consumed by [`Cell::apply`].
pub type CellFn<T, U> = Rc<dyn Fn(&T) -> U>;

pub(crate) struct CellInner<T> {
    node: NodeGuard,
    updates: Stream<T>,
    /// Committed value; `None` until the lazy initializer has run.
    value: RefCell<Option<T>>,
    /// Initial value source, dropped at the first commit.
    lazy: RefCell<Option<Lazy<T>>>,
    /// A commit is queued in the open transaction.
    commit_scheduled: StdCell<bool>,
}

impl<T: Clone + 'static> Vertex for CellInner<T> {
    fn update(self: Rc<Self>) {
        if self.updates.peek().is_none() || self.commit_scheduled.replace(true) {
            return;
        }
        let weak = Rc::downgrade(&self);
        transaction::on_commit(move || {
            let Some(cell) = weak.upgrade() else {
                return;
            };
            cell.commit_scheduled.set(false);
            if let Some(value) = cell.updates.peek() {
                *cell.value.borrow_mut() = Some(value);
                cell.lazy.borrow_mut().take();
            }
        });
        // A transaction that unwinds skips its commits.
        let weak = Rc::downgrade(&self);
        transaction::on_cleanup(move || {
            if let Some(cell) = weak.upgrade() {
                cell.commit_scheduled.set(false);
            }
        });
    }
}

/// A value that changes over time.
pub struct Cell<T> {
    pub(crate) inner: Rc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("node", &self.inner.node.id())
            .field("value", &self.inner.value.borrow())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Cell<T> {
    fn build(label: &'static str, updates: Stream<T>, value: Option<T>, lazy: Option<Lazy<T>>) -> Self {
        let inner = Rc::new(CellInner {
            node: NodeGuard::new(label),
            updates,
            value: RefCell::new(value),
            lazy: RefCell::new(lazy),
            commit_scheduled: StdCell::new(false),
        });
        let id = inner.node.id();
        let weak: Weak<dyn Vertex> = Rc::downgrade(&inner) as Weak<dyn Vertex>;
        graph::set_vertex(id, weak);
        graph::attach(inner.updates.node_id(), id);
        if inner.updates.peek().is_some() {
            transaction::schedule(id);
        }
        Self { inner }
    }

    /// A cell holding `initial` until `updates` fires.
    pub(crate) fn held(updates: Stream<T>, initial: T) -> Self {
        Self::build("hold", updates, Some(initial), None)
    }

    /// A cell whose value before its first update is computed on demand.
    pub(crate) fn lazy(label: &'static str, updates: Stream<T>, initial: impl Fn() -> Result<T> + 'static) -> Self {
        Self::build(label, updates, None, Some(Rc::new(initial)))
    }

    /// A constant cell.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::build("const", Stream::never(), Some(value), None)
    }

    #[inline]
    fn updates_id(&self) -> NodeId {
        self.inner.updates.node_id()
    }

    /// The committed value.
    ///
    /// # Panics
    ///
    /// Panics if the cell depends on a loop that has not been closed. Use
    /// [`Cell::try_sample`] to handle that case.
    #[must_use]
    pub fn sample(&self) -> T {
        match self.try_sample() {
            Ok(value) => value,
            Err(err) => panic!("cannot sample cell: {err}"),
        }
    }

    /// The committed value, or [`Error::UnresolvedLoop`] if it depends on a
    /// loop that has not been closed yet.
    pub fn try_sample(&self) -> Result<T> {
        if let Some(value) = self.inner.value.borrow().as_ref() {
            return Ok(value.clone());
        }
        let lazy = self.inner.lazy.borrow().clone();
        let Some(lazy) = lazy else {
            return Err(Error::UnresolvedLoop);
        };
        let value = lazy()?;
        let mut slot = self.inner.value.borrow_mut();
        if slot.is_none() {
            *slot = Some(value.clone());
        }
        Ok(value)
    }

    /// Value as of the end of propagation in the active transaction.
    pub(crate) fn sample_fresh(&self) -> Result<T> {
        match self.inner.updates.peek() {
            Some(value) => Ok(value),
            None => self.try_sample(),
        }
    }

    fn fired(&self) -> bool {
        self.inner.updates.peek().is_some()
    }

    /// Stream of committed changes. Fires once per transaction that changes
    /// the cell, even when the new value equals the old.
    #[must_use]
    pub fn updates(&self) -> Stream<T> {
        self.inner.updates.clone()
    }

    /// Stream that fires the current value in the transaction it is created
    /// in, then every update.
    #[must_use]
    pub fn value(&self) -> Stream<T> {
        Transaction::run(|| {
            let cell = self.clone();
            let initial = StdCell::new(true);
            stream::derive("value", &[self.updates_id()], move || {
                if initial.replace(false) {
                    fresh_or_record(&cell)
                } else {
                    cell.inner.updates.peek()
                }
            })
        })
    }

    pub fn map<U: Clone + 'static>(&self, f: impl Fn(&T) -> U + 'static) -> Cell<U> {
        let f = Rc::new(f);
        let updates = {
            let f = Rc::clone(&f);
            self.inner.updates.map(move |v| f(v))
        };
        let parent = self.clone();
        Cell::lazy("map", updates, move || parent.try_sample().map(|v| f(&v)))
    }

    /// Combine two cells. Recomputes whenever either changes, reading both
    /// at their values for the same transaction.
    pub fn lift2<U, V>(&self, other: &Cell<U>, f: impl Fn(&T, &U) -> V + 'static) -> Cell<V>
    where
        U: Clone + 'static,
        V: Clone + 'static,
    {
        let f = Rc::new(f);
        let updates = {
            let (a, b, f) = (self.clone(), other.clone(), Rc::clone(&f));
            stream::derive("lift", &[a.updates_id(), b.updates_id()], move || {
                if !(a.fired() || b.fired()) {
                    return None;
                }
                Some(f(&fresh_or_record(&a)?, &fresh_or_record(&b)?))
            })
        };
        let (a, b) = (self.clone(), other.clone());
        Cell::lazy("lift", updates, move || Ok(f(&a.try_sample()?, &b.try_sample()?)))
    }

    pub fn lift3<U, W, V>(
        &self,
        second: &Cell<U>,
        third: &Cell<W>,
        f: impl Fn(&T, &U, &W) -> V + 'static,
    ) -> Cell<V>
    where
        U: Clone + 'static,
        W: Clone + 'static,
        V: Clone + 'static,
    {
        let f = Rc::new(f);
        let updates = {
            let (a, b, c, f) = (self.clone(), second.clone(), third.clone(), Rc::clone(&f));
            let parents = [a.updates_id(), b.updates_id(), c.updates_id()];
            stream::derive("lift", &parents, move || {
                if !(a.fired() || b.fired() || c.fired()) {
                    return None;
                }
                Some(f(
                    &fresh_or_record(&a)?,
                    &fresh_or_record(&b)?,
                    &fresh_or_record(&c)?,
                ))
            })
        };
        let (a, b, c) = (self.clone(), second.clone(), third.clone());
        Cell::lazy("lift", updates, move || {
            Ok(f(&a.try_sample()?, &b.try_sample()?, &c.try_sample()?))
        })
    }

    /// Combine any number of cells into a cell of their values, in order.
    pub fn lift_all(cells: &[Cell<T>]) -> Cell<Vec<T>> {
        if cells.is_empty() {
            return Cell::new(Vec::new());
        }
        let parents: Vec<NodeId> = cells.iter().map(Cell::updates_id).collect();
        let updates = {
            let cells = cells.to_vec();
            stream::derive("lift_all", &parents, move || {
                if !cells.iter().any(Cell::fired) {
                    return None;
                }
                cells.iter().map(fresh_or_record).collect()
            })
        };
        let cells = cells.to_vec();
        Cell::lazy("lift_all", updates, move || {
            cells.iter().map(Cell::try_sample).collect()
        })
    }

    /// Apply the function held in `cf` to this cell's value.
    pub fn apply<U: Clone + 'static>(&self, cf: &Cell<CellFn<T, U>>) -> Cell<U> {
        cf.lift2(self, |f, a| f(a))
    }

    /// Monadic bind: follow whichever cell `f` produced for the current
    /// value.
    pub fn chain<U: Clone + 'static>(&self, f: impl Fn(&T) -> Cell<U> + 'static) -> Cell<U> {
        Transaction::run(|| self.map(f).switch_c())
    }

    /// Comonadic extend: `f` sees a constant cell of each value.
    pub fn extend<U: Clone + 'static>(&self, f: impl Fn(&Cell<T>) -> U + 'static) -> Cell<U> {
        self.map(move |v| f(&Cell::new(v.clone())))
    }

    /// Register `f` with the current value (delivered when the registering
    /// transaction closes) and every later value.
    pub fn listen(&self, f: impl FnMut(&T) + 'static) -> Result<Listener> {
        if self.inner.updates.is_unresolved_loop() {
            return Err(Error::UnresolvedLoop);
        }
        Ok(Transaction::run(|| self.value().listen_unchecked(f)))
    }
}

impl<T: Clone + 'static> Cell<Cell<T>> {
    /// Flatten a cell of cells, following whichever inner cell is current.
    ///
    /// In a transaction where the outer cell switches, the output takes the
    /// new inner cell's value for that transaction, including an update the
    /// new inner cell makes in the same transaction.
    pub fn switch_c(&self) -> Cell<T> {
        Transaction::run(|| {
            let outer = self.clone();
            let out = Stream::detached("switch_c");
            let out_id = out.node_id();
            graph::attach(outer.updates_id(), out_id);
            let current: Rc<RefCell<Option<Cell<T>>>> = Rc::new(RefCell::new(None));
            match outer.try_sample() {
                Ok(inner) => {
                    graph::attach(inner.updates_id(), out_id);
                    *current.borrow_mut() = Some(inner);
                }
                Err(_) => wire_when_resolved(&outer, &current, out_id, Cell::updates_id),
            }

            let state = Rc::clone(&current);
            let watched = outer.clone();
            out.set_source(move || {
                let Some(next) = watched.inner.updates.peek() else {
                    let current = state.borrow().clone();
                    return current.and_then(|inner| inner.inner.updates.peek());
                };
                let rewired = {
                    let mut current = state.borrow_mut();
                    if current.as_ref().is_some_and(|c| Rc::ptr_eq(&c.inner, &next.inner)) {
                        false
                    } else {
                        if let Some(old) = current.take() {
                            graph::unlink(old.updates_id(), out_id);
                        }
                        match graph::link(next.updates_id(), out_id) {
                            Ok(changed) => {
                                *current = Some(next.clone());
                                changed
                            }
                            Err(err) => {
                                transaction::record_failure(err);
                                return None;
                            }
                        }
                    }
                };
                if rewired {
                    // Ranks moved; come back once the new inner cell has run.
                    debug!(node = ?out_id, "switch_c re-ranked; rescheduling");
                    transaction::schedule(out_id);
                    return None;
                }
                fresh_or_record(&next)
            });
            out.activate();
            Cell::lazy("switch_c", out, move || outer.try_sample()?.try_sample())
        })
    }
}

impl<T: Clone + 'static> Cell<Stream<T>> {
    /// Flatten a cell of streams into the stream that is current.
    ///
    /// In a transaction where the outer cell switches, the output still
    /// follows the old stream; the new one takes over from the next
    /// transaction.
    pub fn switch_s(&self) -> Stream<T> {
        Transaction::run(|| {
            let outer = self.clone();
            let out = Stream::detached("switch_s");
            let out_id = out.node_id();
            graph::attach(outer.updates_id(), out_id);
            let current: Rc<RefCell<Option<Stream<T>>>> = Rc::new(RefCell::new(None));
            match outer.try_sample() {
                Ok(inner) => {
                    graph::attach(inner.node_id(), out_id);
                    *current.borrow_mut() = Some(inner);
                }
                Err(_) => wire_when_resolved(&outer, &current, out_id, Stream::node_id),
            }

            let rewiring = Rc::new(StdCell::new(false));
            let state = Rc::clone(&current);
            out.set_source(move || {
                if let Some(next) = outer.inner.updates.peek()
                    && !rewiring.replace(true)
                {
                    let state = Rc::clone(&state);
                    let rewiring = Rc::clone(&rewiring);
                    let reset = Rc::clone(&rewiring);
                    transaction::on_cleanup(move || reset.set(false));
                    transaction::on_commit(move || {
                        rewiring.set(false);
                        let mut current = state.borrow_mut();
                        if let Some(old) = current.take() {
                            graph::unlink(old.node_id(), out_id);
                        }
                        match graph::link(next.node_id(), out_id) {
                            Ok(_) => *current = Some(next),
                            Err(err) => transaction::record_failure(err),
                        }
                    });
                }
                let current = state.borrow().clone();
                current.and_then(|inner| inner.peek())
            });
            out.activate();
            out
        })
    }
}

/// Connect `out_id` to the outer cell's initial inner value once the
/// transaction has settled; used when the outer cell sits on a loop that is
/// closed later in the same transaction.
fn wire_when_resolved<I: Clone + 'static>(
    outer: &Cell<I>,
    current: &Rc<RefCell<Option<I>>>,
    out_id: NodeId,
    node_of: fn(&I) -> NodeId,
) {
    let outer = outer.clone();
    let current = Rc::clone(current);
    transaction::on_commit(move || {
        if current.borrow().is_some() {
            return;
        }
        let wired = outer
            .try_sample()
            .and_then(|inner| graph::link(node_of(&inner), out_id).map(|_| inner));
        match wired {
            Ok(inner) => *current.borrow_mut() = Some(inner),
            Err(err) => transaction::record_failure(err),
        }
    });
}

fn fresh_or_record<T: Clone + 'static>(cell: &Cell<T>) -> Option<T> {
    match cell.sample_fresh() {
        Ok(value) => Some(value),
        Err(err) => {
            transaction::record_failure(err);
            None
        }
    }
}
