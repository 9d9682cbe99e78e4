//! Fixed-size task pools and the emulated execution of each task kind.
//!
//! A pool is created once per kind when the context is configured and never
//! grows. Allocation pops a free slot index, so exhaustion surfaces as
//! `NoMemory` instead of an allocation. Slots carry a generation that makes
//! stale handles harmless.
//!
//! A submitted task may be withdrawn before its completion runs. Withdrawal
//! retires it from the context and from the two-sided matching queues, so a
//! peer never matches against it.

use std::fmt;
use std::mem;

use parking_lot::{Condvar, Mutex};

use crate::buf::NativeBuf;
use crate::conn::NativeConnection;
use crate::mmap::resolve_remote;
use crate::pe::Completion;
use crate::rdma::NativeRdma;
use crate::region::Region;
use crate::{AccessFlags, ConnState, CtxState, DriverError, DriverResult, UserData};

/// Completion callback of a task kind. The callback receives a handle to the
/// finished task and is responsible for freeing it.
pub type TaskCompletionCb = fn(task: TaskHandle, task_user_data: UserData, ctx_user_data: UserData);

/// Task kinds supported by an RDMA context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Write,
    Read,
    Send,
    Receive,
}

impl TaskKind {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Per-kind configuration: completion callbacks and pool size.
#[derive(Clone, Copy)]
pub struct TaskConf {
    pub on_success: TaskCompletionCb,
    pub on_error: TaskCompletionCb,
    pub num_tasks: u32,
}

impl fmt::Debug for TaskConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConf").field("num_tasks", &self.num_tasks).finish()
    }
}

#[derive(Clone)]
pub(crate) enum TaskArgs {
    Empty,
    Write {
        conn: NativeConnection,
        src: NativeBuf,
        dst: NativeBuf,
    },
    Read {
        conn: NativeConnection,
        src: NativeBuf,
        dst: NativeBuf,
    },
    Send {
        conn: NativeConnection,
        buf: NativeBuf,
    },
    Receive {
        buf: NativeBuf,
    },
}

impl TaskArgs {
    fn connection(&self) -> Option<&NativeConnection> {
        match self {
            TaskArgs::Write { conn, .. } | TaskArgs::Read { conn, .. } | TaskArgs::Send { conn, .. } => {
                Some(conn)
            }
            TaskArgs::Empty | TaskArgs::Receive { .. } => None,
        }
    }
}

struct TaskBody {
    generation: u32,
    allocated: bool,
    submitted: bool,
    /// Generation whose completion callback is running.
    in_callback: Option<u32>,
    user_data: UserData,
    args: TaskArgs,
    status: DriverResult<usize>,
}

impl TaskBody {
    /// Marks the slot free and returns whether it was still submitted.
    fn release(&mut self) -> (bool, TaskArgs) {
        let submitted = self.submitted;
        self.allocated = false;
        self.submitted = false;
        self.user_data = UserData::NULL;
        (submitted, mem::replace(&mut self.args, TaskArgs::Empty))
    }
}

struct Slot {
    body: Mutex<TaskBody>,
    callback_done: Condvar,
}

pub(crate) struct TaskPool {
    kind: TaskKind,
    conf: TaskConf,
    slots: Box<[Slot]>,
    free: Mutex<Vec<u32>>,
}

impl TaskPool {
    pub(crate) fn new(kind: TaskKind, conf: TaskConf) -> Self {
        let slots = (0..conf.num_tasks)
            .map(|_| Slot {
                body: Mutex::new(TaskBody {
                    generation: 0,
                    allocated: false,
                    submitted: false,
                    in_callback: None,
                    user_data: UserData::NULL,
                    args: TaskArgs::Empty,
                    status: Ok(0),
                }),
                callback_done: Condvar::new(),
            })
            .collect();
        // Reversed so slot 0 is handed out first.
        let free = (0..conf.num_tasks).rev().collect();
        Self {
            kind,
            conf,
            slots,
            free: Mutex::new(free),
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn allocate(
        &self,
        owner: &NativeRdma,
        args: TaskArgs,
        user_data: UserData,
    ) -> DriverResult<TaskHandle> {
        let index = self.free.lock().pop().ok_or(DriverError::NoMemory)?;
        let mut body = self.slots[index as usize].body.lock();
        body.generation = body.generation.wrapping_add(1);
        body.allocated = true;
        body.submitted = false;
        body.user_data = user_data;
        body.args = args;
        body.status = Ok(0);
        Ok(TaskHandle {
            owner: owner.clone(),
            kind: self.kind,
            index,
            generation: body.generation,
        })
    }
}

/// Handle to an allocated task slot.
///
/// Handles are cheap to clone and all clones name the same slot. Once the
/// slot is freed every clone becomes stale and its calls fail with
/// `BadState`.
#[derive(Clone)]
pub struct TaskHandle {
    owner: NativeRdma,
    kind: TaskKind,
    index: u32,
    generation: u32,
}

impl TaskHandle {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    fn pool(&self) -> DriverResult<&TaskPool> {
        self.owner.pool(self.kind).ok_or(DriverError::DriverFault)
    }

    fn slot(&self) -> DriverResult<&Slot> {
        Ok(&self.pool()?.slots[self.index as usize])
    }

    fn with_body<T>(&self, f: impl FnOnce(&mut TaskBody) -> DriverResult<T>) -> DriverResult<T> {
        let mut body = self.slot()?.body.lock();
        if !body.allocated || body.generation != self.generation {
            return Err(DriverError::BadState);
        }
        f(&mut body)
    }

    pub fn user_data(&self) -> DriverResult<UserData> {
        self.with_body(|body| Ok(body.user_data))
    }

    pub fn set_user_data(&self, data: UserData) -> DriverResult<()> {
        self.with_body(|body| {
            body.user_data = data;
            Ok(())
        })
    }

    /// Completion status. Meaningful inside a completion callback.
    pub fn status(&self) -> DriverResult<()> {
        self.with_body(|body| body.status.map(|_| ()))
    }

    /// Bytes moved by the task (received length for a receive).
    pub fn result_len(&self) -> DriverResult<usize> {
        self.with_body(|body| body.status)
    }

    /// Whether both handles name the same allocation of the same slot.
    pub fn same_task(&self, other: &TaskHandle) -> bool {
        self.kind == other.kind
            && self.index == other.index
            && self.generation == other.generation
            && self.owner.same_context(&other.owner)
    }

    /// Returns the slot to its pool. Freeing a stale handle is a no-op.
    /// Freeing a submitted task withdraws it: its completion never runs.
    pub fn free(&self) {
        let Ok(slot) = self.slot() else { return };
        let released = {
            let mut body = slot.body.lock();
            if !body.allocated || body.generation != self.generation {
                return;
            }
            body.release()
        };
        self.finish_release(released);
    }

    /// Detaches `expected` from the task and frees it, unless its completion
    /// has already claimed the task. Blocks while the completion callback for
    /// this task is running on another thread.
    ///
    /// After this returns, no callback of this task will see `expected`.
    pub fn withdraw(&self, expected: UserData) {
        let Ok(slot) = self.slot() else { return };
        let released = {
            let mut body = slot.body.lock();
            loop {
                if !body.allocated || body.generation != self.generation || body.user_data != expected {
                    return;
                }
                if body.in_callback != Some(self.generation) {
                    break;
                }
                slot.callback_done.wait(&mut body);
            }
            body.release()
        };
        self.finish_release(released);
    }

    fn finish_release(&self, (submitted, args): (bool, TaskArgs)) {
        if submitted {
            self.unqueue(&args);
            let ctx = self.owner.as_ctx();
            let remaining = ctx.task_retired();
            tracing::debug!(kind = ?self.kind, remaining, "withdrew a submitted task");
            if remaining == 0 && ctx.state() == CtxState::Stopping {
                self.owner.finish_stop();
            }
        }
        if let Ok(pool) = self.pool() {
            pool.free.lock().push(self.index);
        }
    }

    /// Drops this task from the matching queue it may be parked in.
    fn unqueue(&self, args: &TaskArgs) {
        let queues = match args {
            TaskArgs::Receive { .. } => Some(self.owner.clone()),
            TaskArgs::Send { conn, .. } => conn.peer().map(|peer| peer.owner().clone()),
            _ => None,
        };
        if let Some(owner) = queues {
            let mut queues = owner.two_sided().lock();
            queues.posted_recvs.retain(|task| !task.same_task(self));
            queues.unmatched_sends.retain(|task| !task.same_task(self));
        }
    }

    /// Arguments of a task that is still waiting for its match.
    fn pending_buf(&self) -> Option<NativeBuf> {
        self.with_body(|body| {
            Ok(match (&body.args, body.submitted) {
                (TaskArgs::Send { buf, .. } | TaskArgs::Receive { buf }, true) => Some(buf.clone()),
                _ => None,
            })
        })
        .ok()
        .flatten()
    }

    /// Hands the task to the driver. Success means exactly one completion
    /// callback will run later on the context's progress engine.
    pub fn submit(&self) -> DriverResult<()> {
        let ctx = self.owner.as_ctx();
        if ctx.state() != CtxState::Running || ctx.pe().is_none() {
            return Err(DriverError::BadState);
        }
        let args = self.with_body(|body| {
            if body.submitted {
                return Err(DriverError::BadState);
            }
            if let Some(conn) = body.args.connection() {
                if conn.state() != ConnState::Established {
                    return Err(DriverError::NotConnected);
                }
            }
            body.submitted = true;
            body.status = Ok(0);
            Ok(body.args.clone())
        })?;
        ctx.task_submitted();

        match args {
            TaskArgs::Write { src, dst, .. } => self.complete(execute_write(&src, &dst)),
            TaskArgs::Read { src, dst, .. } => self.complete(execute_read(&src, &dst)),
            TaskArgs::Send { conn, buf } => self.submit_send(&conn, &buf),
            TaskArgs::Receive { buf } => self.submit_receive(&buf),
            TaskArgs::Empty => self.complete(Err(DriverError::DriverFault)),
        }
        Ok(())
    }

    fn submit_send(&self, conn: &NativeConnection, buf: &NativeBuf) {
        let Some(peer) = conn.peer() else {
            self.complete(Err(DriverError::NotConnected));
            return;
        };
        let receiver = peer.owner();
        let matched = {
            let mut queues = receiver.two_sided().lock();
            loop {
                match queues.posted_recvs.pop_front() {
                    Some(recv) => match recv.pending_buf() {
                        Some(dst) => break Some((recv, dst)),
                        None => tracing::trace!(?recv, "skipping a withdrawn receive"),
                    },
                    None => {
                        queues.unmatched_sends.push_back(self.clone());
                        break None;
                    }
                }
            }
        };
        if let Some((recv, dst)) = matched {
            deliver(self, buf, &recv, &dst);
        }
    }

    fn submit_receive(&self, buf: &NativeBuf) {
        let matched = {
            let mut queues = self.owner.two_sided().lock();
            loop {
                match queues.unmatched_sends.pop_front() {
                    Some(send) => match send.pending_buf() {
                        Some(src) => break Some((send, src)),
                        None => tracing::trace!(?send, "skipping a withdrawn send"),
                    },
                    None => {
                        queues.posted_recvs.push_back(self.clone());
                        break None;
                    }
                }
            }
        };
        if let Some((send, src)) = matched {
            deliver(&send, &src, self, buf);
        }
    }

    /// Records the outcome and queues the completion on the owner's engine.
    pub(crate) fn complete(&self, result: DriverResult<usize>) {
        let recorded = self.with_body(|body| {
            body.status = result;
            Ok(())
        });
        if recorded.is_err() {
            tracing::debug!(kind = ?self.kind, "completion for a withdrawn task");
            return;
        }
        match self.owner.as_ctx().pe() {
            Some(pe) => pe.post(Completion::Task(self.clone())),
            None => tracing::error!(kind = ?self.kind, "task completed on a context without a progress engine"),
        }
    }

    /// Runs the kind's completion callback. Called by the progress engine.
    pub(crate) fn dispatch(self) {
        let Ok(pool) = self.pool() else { return };
        let conf = pool.conf;
        let Ok((user_data, status)) = self.with_body(|body| {
            if !body.submitted {
                return Err(DriverError::BadState);
            }
            body.submitted = false;
            body.in_callback = Some(body.generation);
            Ok((body.user_data, body.status))
        }) else {
            return;
        };

        let ctx = self.owner.as_ctx();
        let remaining = ctx.task_retired();
        let ctx_data = ctx.user_data();
        let owner = self.owner.clone();
        let (kind, index, generation) = (self.kind, self.index, self.generation);
        match status {
            Ok(_) => (conf.on_success)(self, user_data, ctx_data),
            Err(_) => (conf.on_error)(self, user_data, ctx_data),
        }
        if let Some(pool) = owner.pool(kind) {
            let slot = &pool.slots[index as usize];
            let mut body = slot.body.lock();
            if body.in_callback == Some(generation) {
                body.in_callback = None;
            }
            drop(body);
            slot.callback_done.notify_all();
        }
        if remaining == 0 && owner.as_ctx().state() == CtxState::Stopping {
            owner.finish_stop();
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

fn local_region(buf: &NativeBuf) -> DriverResult<&Region> {
    buf.map().local_region().ok_or(DriverError::InvalidValue)
}

fn execute_write(src: &NativeBuf, dst: &NativeBuf) -> DriverResult<usize> {
    let desc = dst.map().remote().ok_or(DriverError::InvalidValue)?;
    let target = resolve_remote(desc, AccessFlags::RDMA_WRITE)?;
    let target_region = target.local_region().ok_or(DriverError::RemoteAccess)?;
    let len = src.data_len();
    Region::copy_between(local_region(src)?, src.offset(), target_region, dst.offset(), len)
        .map_err(|_| DriverError::RemoteAccess)?;
    dst.set_data_len(len)?;
    Ok(len)
}

fn execute_read(src: &NativeBuf, dst: &NativeBuf) -> DriverResult<usize> {
    let desc = src.map().remote().ok_or(DriverError::InvalidValue)?;
    let target = resolve_remote(desc, AccessFlags::RDMA_READ)?;
    let target_region = target.local_region().ok_or(DriverError::RemoteAccess)?;
    let len = src.data_len();
    Region::copy_between(target_region, src.offset(), local_region(dst)?, dst.offset(), len)
        .map_err(|_| DriverError::RemoteAccess)?;
    dst.set_data_len(len)?;
    Ok(len)
}

/// Moves a send's payload into a matched receive and completes both.
fn deliver(send: &TaskHandle, src: &NativeBuf, recv: &TaskHandle, dst: &NativeBuf) {
    let len = src.data_len();
    let copied = if len > dst.len() {
        Err(DriverError::InvalidValue)
    } else {
        local_region(src).and_then(|from| {
            Region::copy_between(from, src.offset(), local_region(dst)?, dst.offset(), len)
        })
    };
    match copied.and_then(|()| dst.set_data_len(len)) {
        Ok(()) => {
            send.complete(Ok(len));
            recv.complete(Ok(len));
        }
        Err(err) => {
            tracing::debug!(len, capacity = dst.len(), %err, "receive could not hold the message");
            send.complete(Err(DriverError::RemoteAccess));
            recv.complete(Err(err));
        }
    }
}
