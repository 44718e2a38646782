#![forbid(unsafe_code)]

//! Transaction coordinator.
//!
//! A transaction is the unit of atomicity: every stimulus sent inside it is
//! propagated through the graph in one rank-ordered pass, cell values are
//! committed together afterwards, and listeners see only final values.
//!
//! # Phases
//!
//! ```text
//! Open ──► Propagating ──► Committing ──► Notifying ──┐
//!              ▲                                      │ (more work queued)
//!              └──────────────────────────────────────┘
//!                                     │ (drained)
//!                                     ▼
//!                                  Closing ──► posts run outside
//! ```
//!
//! 1. **Open**: the caller's closure runs; sinks record their values and
//!    schedule their nodes.
//! 2. **Propagating**: the queue is drained in strictly increasing rank
//!    order. A node scheduled mid-drain is inserted by rank, and the queue
//!    re-sorts itself when a rank repair happens during the drain.
//! 3. **Committing**: deferred cell commits move pending values to
//!    committed.
//! 4. **Notifying**: listener deliveries run with final values.
//! 5. **Closing**: per-node firing slots are cleared, unclosed loops are
//!    reported, and the thread-local state is released. Posted actions then
//!    run outside any transaction, so each can open its own.
//!
//! # Failure Modes
//!
//! - A panicking user closure unwinds through [`Transaction::run`]. The
//!   pending cleanups still run, so firing slots are cleared, and the rest
//!   of the thread-local state is discarded. The next transaction starts
//!   clean.
//! - Listener failures and unresolved loops are collected and surfaced by
//!   [`Transaction::try_run`]; [`Transaction::run`] logs them at `error`
//!   level and continues.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use rustc_hash::FxHashSet;
use tracing::{debug_span, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{self, NodeId};

type Action = Box<dyn FnOnce()>;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<TransactionState>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Propagating,
    Committing,
    Notifying,
    Closing,
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    rank: u64,
    seq: u64,
    node: NodeId,
}

// Min-heap on (rank, seq).
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TransactionState {
    id: u64,
    phase: Phase,
    /// Nodes awaiting propagation, lowest rank first.
    queue: BinaryHeap<QueueEntry>,
    /// Mirror of `queue` membership so a node is queued once.
    scheduled: FxHashSet<NodeId>,
    /// Insertion counter; ties on rank pop in scheduling order.
    seq: u64,
    /// Graph rank epoch the queue keys were computed against.
    rank_epoch: u64,
    /// Nodes popped in the current propagation pass.
    steps: u64,
    /// Cell commits, run once propagation settles.
    last: Vec<Action>,
    /// Listener deliveries, run after commits.
    notify: Vec<Action>,
    /// Firing slot resets, run at close and on unwind.
    cleanup: Vec<Action>,
    /// Run after the transaction is released.
    post: Vec<Action>,
    /// Loop placeholders created here, with their closed flags.
    loops: Vec<(&'static str, Rc<Cell<bool>>)>,
    failures: Vec<Error>,
}

impl TransactionState {
    fn new(id: u64) -> Self {
        Self {
            id,
            phase: Phase::Open,
            queue: BinaryHeap::new(),
            scheduled: FxHashSet::default(),
            seq: 0,
            rank_epoch: graph::rank_epoch(),
            steps: 0,
            last: Vec::new(),
            notify: Vec::new(),
            cleanup: Vec::new(),
            post: Vec::new(),
            loops: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn schedule(&mut self, node: NodeId) {
        if !self.scheduled.insert(node) {
            return;
        }
        self.seq += 1;
        self.queue.push(QueueEntry {
            rank: graph::rank(node),
            seq: self.seq,
            node,
        });
    }

    fn pop(&mut self) -> Option<NodeId> {
        let epoch = graph::rank_epoch();
        if epoch != self.rank_epoch {
            self.rank_epoch = epoch;
            let stale = std::mem::take(&mut self.queue).into_vec();
            self.queue = stale
                .into_iter()
                .map(|entry| QueueEntry {
                    rank: graph::rank(entry.node),
                    ..entry
                })
                .collect();
        }
        let entry = self.queue.pop()?;
        self.scheduled.remove(&entry.node);
        Some(entry.node)
    }

    fn has_pending_work(&self) -> bool {
        !(self.queue.is_empty() && self.last.is_empty() && self.notify.is_empty())
    }
}

/// Entry point for grouping stimuli into one atomic propagation.
///
/// Transactions are implicit: every `send` and graph construction opens one
/// if none is active. Use [`Transaction::run`] to make several sends
/// simultaneous.
#[derive(Debug, Clone, Copy)]
pub struct Transaction;

impl Transaction {
    /// Run `f` inside a transaction, opening one if none is active.
    ///
    /// Nested calls join the outer transaction; nothing commits until the
    /// outermost call returns.
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        if Self::is_active() {
            return f();
        }
        let (out, transaction, failures) = run_outermost(f);
        for failure in &failures {
            error!(transaction, %failure, "transaction failure");
        }
        out
    }

    /// Like [`Transaction::run`], but reports failures collected while the
    /// transaction was open (listener panics, unresolved loops).
    ///
    /// A nested call cannot see the outcome of the enclosing transaction
    /// and always returns `Ok`.
    pub fn try_run<R>(f: impl FnOnce() -> R) -> Result<R> {
        if Self::is_active() {
            return Ok(f());
        }
        let (out, transaction, failures) = run_outermost(f);
        if failures.is_empty() {
            Ok(out)
        } else {
            Err(Error::Transaction {
                transaction,
                failures,
            })
        }
    }

    /// Run `f` after the current transaction has committed and notified its
    /// listeners, outside of it. Without an active transaction an empty one
    /// is opened and `f` runs once it closes.
    pub fn post(f: impl FnOnce() + 'static) {
        Self::run(|| push_post(Box::new(f)));
    }

    #[must_use]
    pub fn is_active() -> bool {
        CURRENT.with(|current| current.borrow().is_some())
    }

    /// Id of the active transaction, if any.
    #[must_use]
    pub fn current_id() -> Option<u64> {
        CURRENT.with(|current| current.borrow().as_ref().map(|state| state.id))
    }
}

/// Releases transaction state when a user closure unwinds. Cleanups still
/// run so no node keeps a firing slot or delivery mark from the abandoned
/// transaction; every other queued action is dropped.
struct AbandonOnUnwind;

impl Drop for AbandonOnUnwind {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let abandoned = CURRENT
            .try_with(|current| current.try_borrow_mut().ok().and_then(|mut c| c.take()))
            .ok()
            .flatten();
        let Some(mut state) = abandoned else {
            return;
        };
        warn!(transaction = state.id, phase = ?state.phase, "transaction abandoned by a panic");
        let cleanups = std::mem::take(&mut state.cleanup);
        drop(state);
        for cleanup in cleanups {
            cleanup();
        }
    }
}

fn run_outermost<R>(f: impl FnOnce() -> R) -> (R, u64, Vec<Error>) {
    let id = NEXT_TRANSACTION_ID.fetch_add(1, AtomicOrdering::Relaxed);
    let span = debug_span!("frp.transaction", id);
    let _entered = span.enter();
    CURRENT.with(|current| *current.borrow_mut() = Some(TransactionState::new(id)));
    let guard = AbandonOnUnwind;
    let out = f();
    let (failures, posts) = close();
    drop(guard);
    for post in posts {
        post();
    }
    (out, id, failures)
}

fn with_state<R>(f: impl FnOnce(&mut TransactionState) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow_mut().as_mut().map(f))
}

fn close() -> (Vec<Error>, Vec<Action>) {
    loop {
        propagate();
        let commits = with_state(|s| {
            s.phase = Phase::Committing;
            std::mem::take(&mut s.last)
        })
        .unwrap_or_default();
        for commit in commits {
            commit();
        }
        let deliveries = with_state(|s| {
            s.phase = Phase::Notifying;
            std::mem::take(&mut s.notify)
        })
        .unwrap_or_default();
        for deliver in deliveries {
            deliver();
        }
        if !with_state(|s| s.has_pending_work()).unwrap_or(false) {
            break;
        }
    }

    let cleanups = with_state(|s| {
        s.phase = Phase::Closing;
        std::mem::take(&mut s.cleanup)
    })
    .unwrap_or_default();
    for cleanup in cleanups {
        cleanup();
    }

    let Some(mut state) = CURRENT.with(|current| current.borrow_mut().take()) else {
        return (Vec::new(), Vec::new());
    };
    for (label, closed) in state.loops.drain(..) {
        if !closed.get() {
            error!(transaction = state.id, loop_kind = label, "loop was never closed");
            state.failures.push(Error::UnresolvedLoop);
        }
    }
    let posts = std::mem::take(&mut state.post);
    (std::mem::take(&mut state.failures), posts)
}

fn propagate() {
    let max_steps = RuntimeConfig::current().max_propagation_steps;
    loop {
        let next = with_state(|s| {
            s.phase = Phase::Propagating;
            s.steps += 1;
            (s.steps, s.pop())
        });
        let Some((steps, Some(node))) = next else {
            break;
        };
        if steps > max_steps {
            let label = graph::label(node);
            error!(node = label, max_steps, "propagation step limit exceeded");
            with_state(|s| {
                s.queue.clear();
                s.scheduled.clear();
                s.failures.push(Error::CyclicDependency { node: label });
            });
            break;
        }
        let Some(vertex) = graph::vertex(node) else {
            continue;
        };
        trace!(?node, rank = graph::rank(node), "propagate");
        vertex.update();
    }
    with_state(|s| s.steps = 0);
}

/// Queue `node` for propagation in the active transaction.
pub(crate) fn schedule(node: NodeId) {
    if with_state(|s| s.schedule(node)).is_none() {
        Transaction::run(|| schedule(node));
    }
}

pub(crate) fn schedule_children(node: NodeId) {
    let children = graph::children(node);
    if children.is_empty() {
        return;
    }
    with_state(|s| {
        for child in children {
            s.schedule(child);
        }
    });
}

fn defer(action: Action, pick: fn(&mut TransactionState) -> &mut Vec<Action>) {
    let mut action = Some(action);
    with_state(|s| {
        if let Some(action) = action.take() {
            pick(s).push(action);
        }
    });
    if let Some(action) = action {
        action();
    }
}

/// Run `f` once propagation of the active transaction has settled.
pub(crate) fn on_commit(f: impl FnOnce() + 'static) {
    defer(Box::new(f), |s| &mut s.last);
}

/// Run `f` once cell values have been committed.
pub(crate) fn on_notify(f: impl FnOnce() + 'static) {
    defer(Box::new(f), |s| &mut s.notify);
}

/// Run `f` when the active transaction closes.
pub(crate) fn on_cleanup(f: impl FnOnce() + 'static) {
    defer(Box::new(f), |s| &mut s.cleanup);
}

fn push_post(f: Action) {
    defer(f, |s| &mut s.post);
}

pub(crate) fn record_failure(failure: Error) {
    let mut failure = Some(failure);
    with_state(|s| {
        if let Some(failure) = failure.take() {
            s.failures.push(failure);
        }
    });
    if let Some(failure) = failure {
        error!(%failure, "failure outside of a transaction");
    }
}

/// Watch a loop placeholder; it must be closed before the transaction ends.
pub(crate) fn track_loop(kind: &'static str, closed: Rc<Cell<bool>>) {
    with_state(|s| s.loops.push((kind, closed)));
}

/// Whether sinks may inject new values right now. Sends issued while the
/// graph is propagating or notifying are deferred to a later transaction.
pub(crate) fn accepting_sends() -> bool {
    with_state(|s| s.phase == Phase::Open).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeGuard;
    use std::panic::{self, AssertUnwindSafe};
    use tracing_test::traced_test;

    #[test]
    fn nested_runs_share_one_transaction() {
        assert!(!Transaction::is_active());
        let (outer, inner) = Transaction::run(|| {
            let outer = Transaction::current_id();
            let inner = Transaction::run(Transaction::current_id);
            (outer, inner)
        });
        assert!(outer.is_some());
        assert_eq!(outer, inner);
        assert!(!Transaction::is_active());
    }

    #[test]
    fn posts_run_after_commits_and_outside() {
        let log = Rc::new(RefCell::new(Vec::new()));
        Transaction::run(|| {
            let l = Rc::clone(&log);
            Transaction::post(move || {
                l.borrow_mut().push(("post", Transaction::is_active()));
            });
            let l = Rc::clone(&log);
            on_commit(move || l.borrow_mut().push(("commit", Transaction::is_active())));
        });
        assert_eq!(*log.borrow(), vec![("commit", true), ("post", false)]);
    }

    #[test]
    fn deferred_actions_run_immediately_without_transaction() {
        let hit = Rc::new(Cell::new(false));
        let h = Rc::clone(&hit);
        on_commit(move || h.set(true));
        assert!(hit.get());
    }

    #[test]
    fn queue_pops_in_rank_order() {
        let low = NodeGuard::new("low");
        let high = NodeGuard::new("high");
        graph::attach(low.id(), high.id());
        let order = Transaction::run(|| {
            with_state(|s| {
                s.schedule(high.id());
                s.schedule(low.id());
                s.schedule(high.id());
                let mut order = Vec::new();
                while let Some(node) = s.pop() {
                    order.push(node);
                }
                order
            })
        });
        assert_eq!(order, Some(vec![low.id(), high.id()]));
    }

    #[test]
    fn unclosed_loop_fails_try_run() {
        let err = Transaction::try_run(|| {
            track_loop("stream_loop", Rc::new(Cell::new(false)));
        })
        .expect_err("unclosed loop");
        assert!(err.is_unresolved_loop());
    }

    #[test]
    fn panicking_closure_leaves_no_transaction_behind() {
        let result = std::panic::catch_unwind(|| {
            let _: u32 = Transaction::run(|| panic!("inside transaction"));
        });
        assert!(result.is_err());
        assert!(!Transaction::is_active());
        assert!(Transaction::try_run(|| 1).is_ok());
    }

    #[test]
    fn cleanups_run_when_a_transaction_unwinds() {
        let cleaned = Rc::new(Cell::new(false));
        let committed = Rc::new(Cell::new(false));
        let (c, k) = (Rc::clone(&cleaned), Rc::clone(&committed));
        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let _: () = Transaction::run(move || {
                on_cleanup(move || c.set(true));
                on_commit(move || k.set(true));
                panic!("after queueing work");
            });
        }));
        assert!(result.is_err());
        assert!(cleaned.get());
        assert!(!committed.get());
        assert!(!Transaction::is_active());
    }

    #[traced_test]
    #[test]
    fn run_logs_collected_failures() {
        let out = Transaction::run(|| {
            record_failure(Error::UnresolvedLoop);
            7
        });
        assert_eq!(out, 7);
        assert!(logs_contain("transaction failure"));
        assert!(logs_contain("loop used before close"));
    }
}
