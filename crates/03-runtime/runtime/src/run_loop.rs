//! Cross-thread run loop over an intrusive FIFO.
//!
//! Scheduled work is a [`TaskNode`] embedded in the operation that scheduled
//! it, so enqueuing never allocates. The queue is circular through a sentinel
//! that lives inside the loop's mutex: the sentinel's `next` is the oldest
//! node and its `tail` the newest, or the sentinel itself when empty.
//!
//! One driver thread calls [`RunLoop::run`]; any thread may schedule.
//! Dropping a started [`ScheduleOperation`] unlinks its node if it is still
//! queued, or waits for the driver thread to finish executing it.

use std::convert::Infallible;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::engine::ProgressEngine;
use crate::sender::{OperationState, Receiver, Scheduler, Sender};

/// What the driver thread does when a pass found no work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Busy-poll.
    Spin,
    /// Yield the time slice between passes.
    Yield,
    /// Sleep on the queue's condition variable. Scheduling or finishing
    /// wakes the thread early; the timeout bounds completion latency.
    Park(Duration),
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Park(Duration::from_micros(50))
    }
}

/// Run loop configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunLoopConfig {
    pub idle: IdleStrategy,
}

impl RunLoopConfig {
    pub fn with_idle(idle: IdleStrategy) -> Self {
        Self { idle }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
union NodeSlot {
    tail: *mut TaskNode,
    execute: unsafe fn(*mut TaskNode),
}

/// Link embedded in every scheduled operation. Queued nodes use `execute`;
/// only the sentinel uses `tail`. `next` is null exactly when the node is
/// not queued.
#[repr(C)]
pub struct TaskNode {
    next: *mut TaskNode,
    slot: NodeSlot,
}

impl TaskNode {
    fn unlinked() -> Self {
        Self {
            next: ptr::null_mut(),
            slot: NodeSlot {
                tail: ptr::null_mut(),
            },
        }
    }
}

struct Queue {
    sentinel: TaskNode,
    /// Node popped and not yet retired, with the thread executing it.
    running: Option<(*mut TaskNode, ThreadId)>,
}

impl Queue {
    fn is_empty(&self) -> bool {
        ptr::eq(self.sentinel.next, &self.sentinel)
    }
}

/// Scheduler queue plus the driver-thread loop.
pub struct RunLoop {
    head: Mutex<Queue>,
    wakeup: Condvar,
    retired: Condvar,
    stop: AtomicBool,
    config: RunLoopConfig,
}

// SAFETY: the raw links are only read or written with `head` locked, and an
// operation cannot be released while its node is queued or running.
unsafe impl Send for RunLoop {}
unsafe impl Sync for RunLoop {}

impl RunLoop {
    pub fn new(config: RunLoopConfig) -> Arc<Self> {
        let run_loop = Arc::new(Self {
            head: Mutex::new(Queue {
                sentinel: TaskNode::unlinked(),
                running: None,
            }),
            wakeup: Condvar::new(),
            retired: Condvar::new(),
            stop: AtomicBool::new(false),
            config,
        });
        {
            let mut queue = run_loop.head.lock();
            let sentinel: *mut TaskNode = &mut queue.sentinel;
            queue.sentinel.next = sentinel;
            queue.sentinel.slot.tail = sentinel;
        }
        run_loop
    }

    pub fn config(&self) -> RunLoopConfig {
        self.config
    }

    pub fn scheduler(self: &Arc<Self>) -> RunLoopScheduler {
        RunLoopScheduler {
            run_loop: self.clone(),
        }
    }

    /// Appends `node`. A node that is already queued stays where it is.
    ///
    /// # Safety
    /// `node` must have its `execute` slot set and must stay valid until it
    /// has been executed or withdrawn.
    unsafe fn push_back(&self, node: *mut TaskNode) {
        {
            let mut guard = self.head.lock();
            let head: *mut TaskNode = &mut guard.sentinel;
            if !(*node).next.is_null() {
                return;
            }
            (*node).next = head;
            // The sentinel is addressed through the current guard, never
            // through a link stored under an earlier one.
            let tail = (*head).slot.tail;
            if tail == head {
                (*head).next = node;
            } else {
                (*tail).next = node;
            }
            (*head).slot.tail = node;
        }
        self.wakeup.notify_one();
    }

    /// Unlinks the oldest node and marks it running on this thread.
    fn pop_front(&self) -> Option<*mut TaskNode> {
        let mut guard = self.head.lock();
        let head: *mut TaskNode = &mut guard.sentinel;
        // SAFETY: links are only touched under the lock and point at queued
        // nodes or the sentinel.
        let node = unsafe {
            if (*head).slot.tail == (*head).next {
                (*head).slot.tail = head;
            }
            let node = (*head).next;
            if node == head {
                return None;
            }
            (*head).next = (*node).next;
            (*node).next = ptr::null_mut();
            node
        };
        guard.running = Some((node, thread::current().id()));
        Some(node)
    }

    fn retire(&self) {
        self.head.lock().running = None;
        self.retired.notify_all();
    }

    /// Takes `node` out of the queue. When the node has already been popped
    /// by another thread, blocks until that thread has executed it.
    ///
    /// # Safety
    /// `node` must be valid and must not be re-queued concurrently.
    unsafe fn withdraw(&self, node: *mut TaskNode) {
        let mut guard = self.head.lock();
        let head: *mut TaskNode = &mut guard.sentinel;
        if !(*node).next.is_null() {
            let mut prev = head;
            loop {
                let next = (*prev).next;
                if next == node {
                    (*prev).next = (*node).next;
                    if (*head).slot.tail == node {
                        (*head).slot.tail = prev;
                    }
                    (*node).next = ptr::null_mut();
                    tracing::trace!("withdrew a queued node");
                    return;
                }
                if next == head {
                    break;
                }
                prev = next;
            }
        }
        let me = thread::current().id();
        while matches!(guard.running, Some((running, by)) if running == node && by != me) {
            self.retired.wait(&mut guard);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.lock().is_empty()
    }

    /// Number of queued nodes.
    pub fn len(&self) -> usize {
        let mut guard = self.head.lock();
        let head: *mut TaskNode = &mut guard.sentinel;
        let mut len = 0;
        // SAFETY: links are only followed under the lock.
        unsafe {
            let mut node = (*head).next;
            while node != head {
                len += 1;
                node = (*node).next;
            }
        }
        len
    }

    /// Executes queued nodes until the queue is empty. Returns how many ran.
    pub fn run_some(&self) -> usize {
        let mut ran = 0;
        while let Some(node) = self.pop_front() {
            // SAFETY: a popped node is marked running, so its operation
            // cannot be released until `retire`.
            unsafe { ((*node).slot.execute)(node) };
            self.retire();
            ran += 1;
        }
        ran
    }

    /// Drives queued work and engine completions until [`RunLoop::finish`].
    pub fn run(&self, engine: &ProgressEngine) {
        while !self.stop.load(Ordering::Acquire) {
            let mut busy = self.run_some() > 0;
            while engine.progress() {
                busy = true;
            }
            if !busy {
                self.idle();
            }
        }
        tracing::trace!("run loop finished");
    }

    fn idle(&self) {
        match self.config.idle {
            IdleStrategy::Spin => std::hint::spin_loop(),
            IdleStrategy::Yield => std::thread::yield_now(),
            IdleStrategy::Park(timeout) => {
                let mut guard = self.head.lock();
                if guard.is_empty() && !self.stop.load(Ordering::Acquire) {
                    self.wakeup.wait_for(&mut guard, timeout);
                }
            }
        }
    }

    /// Asks the driver thread to leave [`RunLoop::run`]. Work scheduled after
    /// this call may never run.
    pub fn finish(&self) {
        self.stop.store(true, Ordering::Release);
        let _guard = self.head.lock();
        self.wakeup.notify_all();
    }

    pub fn is_finishing(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Handle for scheduling onto a [`RunLoop`].
#[derive(Clone)]
pub struct RunLoopScheduler {
    run_loop: Arc<RunLoop>,
}

impl RunLoopScheduler {
    pub fn run_loop(&self) -> &Arc<RunLoop> {
        &self.run_loop
    }
}

impl PartialEq for RunLoopScheduler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.run_loop, &other.run_loop)
    }
}

impl Scheduler for RunLoopScheduler {
    type Sender = ScheduleSender;

    fn schedule(&self) -> ScheduleSender {
        ScheduleSender {
            run_loop: self.run_loop.clone(),
        }
    }
}

/// Completes with `()` on the driver thread, or with stopped if the
/// receiver's token was triggered by then.
pub struct ScheduleSender {
    run_loop: Arc<RunLoop>,
}

impl Sender for ScheduleSender {
    type Output = ();
    type Error = Infallible;
    type Operation<R: Receiver<(), Infallible>> = ScheduleOperation<R>;

    fn connect<R: Receiver<(), Infallible>>(self, receiver: R) -> ScheduleOperation<R> {
        ScheduleOperation {
            node: TaskNode::unlinked(),
            run_loop: self.run_loop,
            receiver: Some(receiver),
            _pin: PhantomPinned,
        }
    }
}

/// The node is the first field, so a node pointer is also a pointer to the
/// whole operation.
#[repr(C)]
pub struct ScheduleOperation<R> {
    node: TaskNode,
    run_loop: Arc<RunLoop>,
    receiver: Option<R>,
    _pin: PhantomPinned,
}

unsafe fn execute_scheduled<R: Receiver<(), Infallible>>(node: *mut TaskNode) {
    let op = node as *mut ScheduleOperation<R>;
    let Some(receiver) = (*op).receiver.take() else {
        return;
    };
    if receiver.stop_token().stop_requested() {
        receiver.set_stopped();
    } else {
        receiver.set_value(());
    }
}

impl<R> Drop for ScheduleOperation<R> {
    fn drop(&mut self) {
        let node: *mut TaskNode = (self as *mut Self).cast();
        // SAFETY: the node is this operation's own first field.
        unsafe { self.run_loop.withdraw(node) };
    }
}

impl<R: Receiver<(), Infallible>> OperationState for ScheduleOperation<R> {
    fn start(self: Pin<&mut Self>) {
        // SAFETY: the operation is pinned; only its address is shared.
        let this = unsafe { self.get_unchecked_mut() };
        this.node.slot = NodeSlot {
            execute: execute_scheduled::<R>,
        };
        let node: *mut TaskNode = (this as *mut Self).cast();
        // SAFETY: the operation is pinned, and dropping it withdraws the node.
        unsafe { this.run_loop.push_back(node) };
    }
}
