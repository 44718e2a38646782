#![forbid(unsafe_code)]

//! Discrete event streams.
//!
//! A [`Stream`] fires at most once per transaction. Each derived stream is a
//! graph node whose value is *pulled* from its parents' firing slots when
//! the coordinator reaches its rank, so by the time a node computes, every
//! parent that fires in this transaction already has.
//!
//! Firing slots hold a value only while the transaction is open; they are
//! cleared when it closes.

use std::any::Any;
use std::cell::{Cell as StdCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::graph::{self, NodeGuard, NodeId, Vertex};
use crate::listener::{Listener, ListenerRegistry};
use crate::transaction::{self, Transaction};

type Pull<T> = Box<dyn Fn() -> Option<T>>;

pub(crate) struct StreamInner<T> {
    node: NodeGuard,
    /// This transaction's occurrence, if the stream has fired.
    firing: RefCell<Option<T>>,
    /// Pulls the occurrence from the parents' firing slots.
    source: RefCell<Option<Pull<T>>>,
    listeners: Rc<ListenerRegistry<T>>,
    /// Upstream handles this node must not outlive.
    keep_alive: RefCell<Vec<Box<dyn Any>>>,
    /// Listener delivery state for the open transaction.
    delivery: StdCell<Delivery>,
    /// Present on loop placeholders; `true` once closed.
    loop_closed: Option<Rc<StdCell<bool>>>,
}

impl<T: Clone + 'static> Vertex for StreamInner<T> {
    fn update(self: Rc<Self>) {
        let value = {
            let source = self.source.borrow();
            source.as_ref().and_then(|pull| pull())
        };
        if let Some(value) = value {
            fire(&self, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Idle,
    Scheduled,
    Done,
}

fn fire<T: Clone + 'static>(inner: &Rc<StreamInner<T>>, value: T) {
    let first = inner.firing.borrow_mut().replace(value).is_none();
    if first {
        let weak = Rc::downgrade(inner);
        transaction::on_cleanup(move || {
            if let Some(inner) = weak.upgrade() {
                inner.firing.borrow_mut().take();
                inner.delivery.set(Delivery::Idle);
            }
        });
    } else {
        warn!(node = ?inner.node.id(), "stream fired twice in one transaction; keeping the later value");
    }
    transaction::schedule_children(inner.node.id());
    if !inner.listeners.is_empty() {
        schedule_delivery(inner);
    }
}

/// Deliver this transaction's occurrence to the listeners once values have
/// been committed. Listeners added after delivery miss it.
fn schedule_delivery<T: Clone + 'static>(inner: &Rc<StreamInner<T>>) {
    if inner.delivery.get() != Delivery::Idle {
        return;
    }
    inner.delivery.set(Delivery::Scheduled);
    let weak = Rc::downgrade(inner);
    transaction::on_notify(move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.delivery.set(Delivery::Done);
        let value = inner.firing.borrow().clone();
        if let Some(value) = value {
            inner.listeners.notify(&value);
        }
    });
}

/// A stream of discrete occurrences of `T`.
pub struct Stream<T> {
    pub(crate) inner: Rc<StreamInner<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("node", &self.inner.node.id())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Stream<T> {
    fn with_source(label: &'static str, source: Option<Pull<T>>, loop_closed: Option<Rc<StdCell<bool>>>) -> Self {
        let inner = Rc::new(StreamInner {
            node: NodeGuard::new(label),
            firing: RefCell::new(None),
            source: RefCell::new(source),
            listeners: Rc::new(ListenerRegistry::default()),
            keep_alive: RefCell::new(Vec::new()),
            delivery: StdCell::new(Delivery::Idle),
            loop_closed,
        });
        let weak: Weak<dyn Vertex> = Rc::downgrade(&inner) as Weak<dyn Vertex>;
        graph::set_vertex(inner.node.id(), weak);
        Self { inner }
    }

    /// A node with no source yet; the caller wires it with [`Stream::set_source`].
    pub(crate) fn detached(label: &'static str) -> Self {
        Self::with_source(label, None, None)
    }

    pub(crate) fn placeholder(closed: Rc<StdCell<bool>>) -> Self {
        Self::with_source("stream_loop", None, Some(closed))
    }

    pub(crate) fn set_source(&self, pull: impl Fn() -> Option<T> + 'static) {
        *self.inner.source.borrow_mut() = Some(Box::new(pull));
    }

    /// Give a freshly built node a chance to see parents that already
    /// fired in the active transaction.
    pub(crate) fn activate(&self) {
        if Transaction::is_active() {
            transaction::schedule(self.node_id());
        }
    }

    #[inline]
    pub(crate) fn node_id(&self) -> NodeId {
        self.inner.node.id()
    }

    /// The value fired in the active transaction, if any.
    pub(crate) fn peek(&self) -> Option<T> {
        self.inner.firing.borrow().clone()
    }

    pub(crate) fn is_unresolved_loop(&self) -> bool {
        self.inner
            .loop_closed
            .as_ref()
            .is_some_and(|closed| !closed.get())
    }

    /// Keep `value` alive for as long as this stream is.
    pub(crate) fn retain(&self, value: impl Any) {
        self.inner.keep_alive.borrow_mut().push(Box::new(value));
    }

    /// A stream that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::with_source("never", None, None)
    }

    pub fn map<U: Clone + 'static>(&self, f: impl Fn(&T) -> U + 'static) -> Stream<U> {
        let parent = self.clone();
        derive("map", &[self.node_id()], move || parent.peek().map(|v| f(&v)))
    }

    /// Replace every occurrence with `value`.
    pub fn map_to<U: Clone + 'static>(&self, value: U) -> Stream<U> {
        self.map(move |_| value.clone())
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + 'static) -> Stream<T> {
        let parent = self.clone();
        derive("filter", &[self.node_id()], move || {
            parent.peek().filter(|v| predicate(v))
        })
    }

    /// Map and drop occurrences for which `f` returns `None`.
    pub fn filter_map<U: Clone + 'static>(&self, f: impl Fn(&T) -> Option<U> + 'static) -> Stream<U> {
        let parent = self.clone();
        derive("filter_map", &[self.node_id()], move || {
            parent.peek().and_then(|v| f(&v))
        })
    }

    /// Fire whenever either stream fires. When both fire in the same
    /// transaction the output is `resolve(self_value, other_value)`.
    ///
    /// Chained merges fold left: `a.merge(&b, f).merge(&c, f)` fires
    /// `f(f(a, b), c)` when all three coincide.
    pub fn merge(&self, other: &Stream<T>, resolve: impl Fn(&T, &T) -> T + 'static) -> Stream<T> {
        let left = self.clone();
        let right = other.clone();
        derive("merge", &[self.node_id(), other.node_id()], move || {
            match (left.peek(), right.peek()) {
                (Some(a), Some(b)) => Some(resolve(&a, &b)),
                (a, b) => a.or(b),
            }
        })
    }

    /// Merge preferring this stream's value on coincidence.
    pub fn or_else(&self, other: &Stream<T>) -> Stream<T> {
        self.merge(other, |a, _| a.clone())
    }

    /// Merge any number of streams as a pairwise left fold.
    pub fn merge_all(
        streams: impl IntoIterator<Item = Stream<T>>,
        resolve: impl Fn(&T, &T) -> T + 'static,
    ) -> Stream<T> {
        let resolve = Rc::new(resolve);
        let mut streams = streams.into_iter();
        let Some(first) = streams.next() else {
            return Stream::never();
        };
        streams.fold(first, |acc, next| {
            let resolve = Rc::clone(&resolve);
            acc.merge(&next, move |a, b| resolve(a, b))
        })
    }

    /// Fire `f(value, cell)` where `cell` is read as committed before this
    /// transaction; updates to `cell` in the same transaction are not seen.
    pub fn snapshot<U, V>(&self, cell: &Cell<U>, f: impl Fn(&T, &U) -> V + 'static) -> Stream<V>
    where
        U: Clone + 'static,
        V: Clone + 'static,
    {
        let parent = self.clone();
        let cell = cell.clone();
        derive("snapshot", &[self.node_id()], move || {
            let value = parent.peek()?;
            let sampled = sample_or_record(&cell)?;
            Some(f(&value, &sampled))
        })
    }

    /// Fire the committed value of `cell` whenever this stream fires.
    pub fn snapshot1<U: Clone + 'static>(&self, cell: &Cell<U>) -> Stream<U> {
        self.snapshot(cell, |_, sampled| sampled.clone())
    }

    pub fn snapshot2<U, W, V>(
        &self,
        first: &Cell<U>,
        second: &Cell<W>,
        f: impl Fn(&T, &U, &W) -> V + 'static,
    ) -> Stream<V>
    where
        U: Clone + 'static,
        W: Clone + 'static,
        V: Clone + 'static,
    {
        let parent = self.clone();
        let first = first.clone();
        let second = second.clone();
        derive("snapshot", &[self.node_id()], move || {
            let value = parent.peek()?;
            let a = sample_or_record(&first)?;
            let b = sample_or_record(&second)?;
            Some(f(&value, &a, &b))
        })
    }

    /// Let occurrences through only while `open` is `true`.
    pub fn gate(&self, open: &Cell<bool>) -> Stream<T> {
        let parent = self.clone();
        let open = open.clone();
        derive("gate", &[self.node_id()], move || {
            let value = parent.peek()?;
            sample_or_record(&open)?.then_some(value)
        })
    }

    /// Fire only the first occurrence.
    pub fn once(&self) -> Stream<T> {
        let parent = self.clone();
        let done = StdCell::new(false);
        derive("once", &[self.node_id()], move || {
            if done.get() {
                return None;
            }
            let value = parent.peek()?;
            done.set(true);
            Some(value)
        })
    }

    /// A cell holding the most recent occurrence, starting at `initial`.
    ///
    /// The new value is committed when the transaction that fired it closes,
    /// so sampling inside that transaction still returns the previous value.
    pub fn hold(&self, initial: T) -> Cell<T> {
        Transaction::run(|| Cell::held(self.clone(), initial))
    }

    /// Fold occurrences into a cell: each occurrence `v` commits
    /// `f(v, previous_state)`.
    pub fn accum<S: Clone + 'static>(&self, initial: S, f: impl Fn(&T, &S) -> S + 'static) -> Cell<S> {
        Transaction::run(|| {
            let state = crate::loops::CellLoop::new();
            let next = self.snapshot(&state.cell(), f).hold(initial);
            if let Err(err) = state.close(&next) {
                transaction::record_failure(err);
            }
            next
        })
    }

    /// Register `f` for every occurrence.
    ///
    /// Fails with [`Error::UnresolvedLoop`] when called on a loop placeholder
    /// that has not been closed.
    pub fn listen(&self, f: impl FnMut(&T) + 'static) -> Result<Listener> {
        if self.is_unresolved_loop() {
            return Err(Error::UnresolvedLoop);
        }
        Ok(self.listen_unchecked(f))
    }

    pub(crate) fn listen_unchecked(&self, f: impl FnMut(&T) + 'static) -> Listener {
        let (id, active) = self.inner.listeners.add(f);
        debug!(listener = id, node = ?self.node_id(), "listener registered");
        if self.peek().is_some() {
            schedule_delivery(&self.inner);
        }
        Listener::new(&self.inner.listeners, id, active, Box::new(Rc::clone(&self.inner)))
    }

    /// Register `f` for the next occurrence only.
    pub fn listen_once(&self, f: impl FnOnce(&T) + 'static) -> Result<Listener> {
        if self.is_unresolved_loop() {
            return Err(Error::UnresolvedLoop);
        }
        let mut f = Some(f);
        Ok(self.once().listen_unchecked(move |value| {
            if let Some(f) = f.take() {
                f(value);
            }
        }))
    }
}

/// Build a node computed by `pull` from the firing slots of `parents`.
pub(crate) fn derive<U: Clone + 'static>(
    label: &'static str,
    parents: &[NodeId],
    pull: impl Fn() -> Option<U> + 'static,
) -> Stream<U> {
    let out = Stream::with_source(label, Some(Box::new(pull)), None);
    for parent in parents {
        graph::attach(*parent, out.node_id());
    }
    out.activate();
    out
}

/// Committed value of `cell`, recording the failure on the transaction when
/// it cannot be read.
fn sample_or_record<U: Clone + 'static>(cell: &Cell<U>) -> Option<U> {
    match cell.try_sample() {
        Ok(value) => Some(value),
        Err(err) => {
            transaction::record_failure(err);
            None
        }
    }
}

type Coalesce<T> = Rc<dyn Fn(&T, &T) -> T>;

/// The external entry point: a stream that fires whatever is sent to it.
pub struct StreamSink<T> {
    stream: Stream<T>,
    pending: Rc<RefCell<Option<T>>>,
    coalesce: Coalesce<T>,
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            pending: Rc::clone(&self.pending),
            coalesce: Rc::clone(&self.coalesce),
        }
    }
}

impl<T> fmt::Debug for StreamSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Default for StreamSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> StreamSink<T> {
    /// A sink where the last value sent in a transaction wins.
    #[must_use]
    pub fn new() -> Self {
        Self::with_coalescer(|_, latest| latest.clone())
    }

    /// A sink that combines values sent in the same transaction with
    /// `coalesce(earlier, later)`.
    pub fn with_coalescer(coalesce: impl Fn(&T, &T) -> T + 'static) -> Self {
        let pending: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let source = Rc::clone(&pending);
        let stream = Stream::with_source(
            "sink",
            Some(Box::new(move || source.borrow_mut().take())),
            None,
        );
        Self {
            stream,
            pending,
            coalesce: Rc::new(coalesce),
        }
    }

    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        self.stream.clone()
    }

    /// Fire `value` in the active transaction, opening one if needed.
    ///
    /// Called from a listener or a combinator while the graph is busy, the
    /// send is deferred to a fresh transaction after the current one closes.
    pub fn send(&self, value: T) {
        if !transaction::accepting_sends() {
            let sink = self.clone();
            Transaction::post(move || sink.send(value));
            return;
        }
        Transaction::run(|| {
            let previous = self.pending.borrow_mut().take();
            let next = match previous {
                Some(previous) => {
                    debug!(node = ?self.stream.node_id(), "sink sent twice; coalescing");
                    (self.coalesce)(&previous, &value)
                }
                None => {
                    let pending = Rc::downgrade(&self.pending);
                    transaction::on_cleanup(move || {
                        if let Some(pending) = pending.upgrade() {
                            pending.borrow_mut().take();
                        }
                    });
                    value
                }
            };
            *self.pending.borrow_mut() = Some(next);
            transaction::schedule(self.stream.node_id());
        });
    }

    pub(crate) fn downgrade(&self) -> WeakSink<T> {
        WeakSink {
            stream: Rc::downgrade(&self.stream.inner),
            pending: Rc::downgrade(&self.pending),
            coalesce: Rc::clone(&self.coalesce),
        }
    }
}

/// Non-owning sink handle; lets a producer outlive unused streams.
pub(crate) struct WeakSink<T> {
    stream: Weak<StreamInner<T>>,
    pending: Weak<RefCell<Option<T>>>,
    coalesce: Coalesce<T>,
}

impl<T> Clone for WeakSink<T> {
    fn clone(&self) -> Self {
        Self {
            stream: Weak::clone(&self.stream),
            pending: Weak::clone(&self.pending),
            coalesce: Rc::clone(&self.coalesce),
        }
    }
}

impl<T> WeakSink<T> {
    pub(crate) fn upgrade(&self) -> Option<StreamSink<T>> {
        Some(StreamSink {
            stream: Stream {
                inner: self.stream.upgrade()?,
            },
            pending: self.pending.upgrade()?,
            coalesce: Rc::clone(&self.coalesce),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<T: Clone + 'static>(stream: &Stream<T>) -> (Listener, Rc<RefCell<Vec<T>>>) {
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&out);
        let listener = stream
            .listen(move |v: &T| o.borrow_mut().push(v.clone()))
            .expect("listen");
        (listener, out)
    }

    #[test]
    fn map_and_filter() {
        let sink = StreamSink::new();
        let evens = sink.stream().filter(|v: &i32| v % 2 == 0).map(|v| v * 10);
        let (_l, out) = collect(&evens);
        for v in 1..=4 {
            sink.send(v);
        }
        assert_eq!(*out.borrow(), vec![20, 40]);
    }

    #[test]
    fn filter_map_drops_none() {
        let sink = StreamSink::new();
        let parsed = sink.stream().filter_map(|s: &&str| s.parse::<i32>().ok());
        let (_l, out) = collect(&parsed);
        sink.send("7");
        sink.send("x");
        sink.send("8");
        assert_eq!(*out.borrow(), vec![7, 8]);
    }

    #[test]
    fn merge_resolves_coincident_firings() {
        let a = StreamSink::new();
        let b = StreamSink::new();
        let sum = a.stream().merge(&b.stream(), |x: &i32, y| x + y);
        let (_l, out) = collect(&sum);
        a.send(1);
        Transaction::run(|| {
            a.send(5);
            b.send(42);
        });
        b.send(3);
        assert_eq!(*out.borrow(), vec![1, 47, 3]);
    }

    #[test]
    fn or_else_prefers_left() {
        let a = StreamSink::new();
        let b = StreamSink::new();
        let (_l, out) = collect(&a.stream().or_else(&b.stream()));
        Transaction::run(|| {
            b.send("right");
            a.send("left");
        });
        assert_eq!(*out.borrow(), vec!["left"]);
    }

    #[test]
    fn sink_coalesces_within_one_transaction() {
        let sink = StreamSink::with_coalescer(|a: &i32, b| a + b);
        let (_l, out) = collect(&sink.stream());
        Transaction::run(|| {
            sink.send(1);
            sink.send(2);
            sink.send(3);
        });
        assert_eq!(*out.borrow(), vec![6]);
    }

    #[test]
    fn hold_commits_after_transaction() {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(0);
        let inside = Transaction::run(|| {
            sink.send(9);
            cell.sample()
        });
        assert_eq!(inside, 0);
        assert_eq!(cell.sample(), 9);
    }

    #[test]
    fn snapshot_sees_pre_transaction_value() {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(1);
        let snap = sink.stream().snapshot(&cell, |new: &i32, old| (*new, *old));
        let (_l, out) = collect(&snap);
        sink.send(2);
        sink.send(3);
        assert_eq!(*out.borrow(), vec![(2, 1), (3, 2)]);
    }

    #[test]
    fn gate_and_once() {
        let sink = StreamSink::new();
        let open = StreamSink::new();
        let gated = sink.stream().gate(&open.stream().hold(false));
        let (_g, gated_out) = collect(&gated);
        let (_o, once_out) = collect(&sink.stream().once());
        sink.send(1);
        open.send(true);
        sink.send(2);
        sink.send(3);
        assert_eq!(*gated_out.borrow(), vec![2, 3]);
        assert_eq!(*once_out.borrow(), vec![1]);
    }

    #[test]
    fn accum_folds_state() {
        let sink = StreamSink::new();
        let total = sink.stream().accum(0, |delta: &i32, total| total + delta);
        for v in [1, 2, 3] {
            sink.send(v);
        }
        assert_eq!(total.sample(), 6);
    }

    #[test]
    fn send_from_listener_runs_in_a_later_transaction() {
        let first = StreamSink::new();
        let second = StreamSink::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let relay = second.clone();
        let s = Rc::clone(&seen);
        let _relay = first
            .stream()
            .listen(move |v: &i32| {
                s.borrow_mut().push(("first", Transaction::current_id()));
                relay.send(*v);
            })
            .expect("listen");
        let s = Rc::clone(&seen);
        let _sink = second
            .stream()
            .listen(move |_| s.borrow_mut().push(("second", Transaction::current_id())))
            .expect("listen");
        first.send(1);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].1, seen[1].1);
    }

    #[test]
    fn listen_once_fires_once() {
        let sink = StreamSink::new();
        let hits = Rc::new(StdCell::new(0));
        let h = Rc::clone(&hits);
        let _l = sink
            .stream()
            .listen_once(move |v: &i32| h.set(h.get() + v))
            .expect("listen");
        sink.send(5);
        sink.send(6);
        assert_eq!(hits.get(), 5);
    }

    #[test]
    fn listening_late_in_a_transaction_still_delivers() {
        let sink = StreamSink::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&out);
        let _l = Transaction::run(|| {
            sink.send(4);
            sink.stream()
                .map(|v: &i32| v + 1)
                .listen(move |v| o.borrow_mut().push(*v))
                .expect("listen")
        });
        assert_eq!(*out.borrow(), vec![5]);
    }

    #[test]
    fn send_in_an_unwound_transaction_is_discarded() {
        let sink = StreamSink::with_coalescer(|a: &i32, b| a + b);
        let (_l, seen) = collect(&sink.stream());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: () = Transaction::run(|| {
                sink.send(1);
                panic!("before propagation");
            });
        }));
        assert!(result.is_err());
        sink.send(2);
        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn merge_all_of_nothing_never_fires() {
        let merged: Stream<i32> = Stream::merge_all(Vec::new(), |a, _| *a);
        let (_l, out) = collect(&merged);
        assert!(out.borrow().is_empty());
    }
}
