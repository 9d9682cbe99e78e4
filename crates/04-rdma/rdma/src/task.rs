//! Adapts completion-callback tasks to the sender protocol.
//!
//! An [`RdmaOperation`] starts by allocating its task with the address of
//! its own [`CompletionVtable`] as the task's user data. The context-wide
//! completion callbacks cast that address back and call through the table,
//! which restores the operation's concrete type. The table is the first
//! field of a `#[repr(C)]` record, so the two addresses coincide.
//!
//! Dropping a started operation before its completion withdraws the task:
//! the slot goes back to the pool and the receiver is dropped uncompleted.

use std::marker::PhantomPinned;
use std::pin::Pin;

use offload_driver::{DriverError, DriverResult, TaskHandle, TaskKind, UserData};
use offload_runtime::{fatal, OperationState, Receiver, Sender};

use crate::rdma::Rdma;

/// Type-erased completion entry points of one operation.
#[repr(C)]
pub(crate) struct CompletionVtable {
    on_value: unsafe fn(*mut CompletionVtable),
    on_error: unsafe fn(*mut CompletionVtable, DriverError),
    on_stopped: unsafe fn(*mut CompletionVtable),
}

/// Owned task slot. Dropping it returns the slot to its pool.
pub struct NativeTask {
    handle: TaskHandle,
}

impl NativeTask {
    pub(crate) fn new(handle: TaskHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn kind(&self) -> TaskKind {
        self.handle.kind()
    }
}

impl Drop for NativeTask {
    fn drop(&mut self) {
        self.handle.free();
    }
}

/// One kind of offloaded operation.
pub trait RdmaTask: Sized {
    /// Everything needed to allocate the task.
    type Args: Send;
    /// Value delivered on success.
    type Output;

    /// Allocates from `rdma`'s pool with a null correlation tag.
    fn allocate(rdma: &Rdma, args: Self::Args) -> DriverResult<Self>;

    fn as_native_task(&self) -> &NativeTask;

    /// Reads the result. Called from the success callback, before the slot
    /// is freed.
    fn output(&self) -> DriverResult<Self::Output>;

    fn submit(&self) -> DriverResult<()> {
        self.as_native_task().handle().submit()
    }
}

/// Lazy offloaded operation of kind `K`.
pub struct RdmaSender<K: RdmaTask> {
    rdma: Rdma,
    args: K::Args,
}

impl<K: RdmaTask> RdmaSender<K> {
    pub(crate) fn new(rdma: Rdma, args: K::Args) -> Self {
        Self { rdma, args }
    }
}

impl<K: RdmaTask> Sender for RdmaSender<K> {
    type Output = K::Output;
    type Error = DriverError;
    type Operation<R: Receiver<K::Output, DriverError>> = RdmaOperation<K, R>;

    fn connect<R: Receiver<K::Output, DriverError>>(self, receiver: R) -> RdmaOperation<K, R> {
        RdmaOperation {
            vtable: RdmaOperation::<K, R>::VTABLE,
            rdma: self.rdma,
            args: Some(self.args),
            task: None,
            submitted: None,
            receiver: Some(receiver),
            _pin: PhantomPinned,
        }
    }
}

/// Operation record. The driver holds its address between submission and
/// completion.
#[repr(C)]
pub struct RdmaOperation<K: RdmaTask, R> {
    vtable: CompletionVtable,
    rdma: Rdma,
    args: Option<K::Args>,
    task: Option<K>,
    /// Handle of the submitted task. Written before submission and only read
    /// afterwards, by `drop`.
    submitted: Option<TaskHandle>,
    receiver: Option<R>,
    _pin: PhantomPinned,
}

impl<K: RdmaTask, R> Drop for RdmaOperation<K, R> {
    fn drop(&mut self) {
        let record = UserData::from_ptr((self as *mut Self).cast::<CompletionVtable>());
        if let Some(handle) = &self.submitted {
            handle.withdraw(record);
        }
    }
}

impl<K, R> RdmaOperation<K, R>
where
    K: RdmaTask,
    R: Receiver<K::Output, DriverError>,
{
    const VTABLE: CompletionVtable = CompletionVtable {
        on_value: Self::on_value,
        on_error: Self::on_error,
        on_stopped: Self::on_stopped,
    };

    unsafe fn on_value(vtable: *mut CompletionVtable) {
        // SAFETY: `vtable` is the first field of a started, pinned `Self`
        // whose task has just completed; nothing else touches it now.
        let this = unsafe { &mut *vtable.cast::<Self>() };
        let result = match this.task.take() {
            Some(task) => task.output(),
            None => Err(DriverError::DriverFault),
        };
        let Some(receiver) = this.receiver.take() else {
            return;
        };
        match result {
            Ok(value) => receiver.set_value(value),
            Err(err) => receiver.set_error(err),
        }
    }

    unsafe fn on_error(vtable: *mut CompletionVtable, err: DriverError) {
        // SAFETY: as in `on_value`.
        let this = unsafe { &mut *vtable.cast::<Self>() };
        this.task = None;
        if let Some(receiver) = this.receiver.take() {
            receiver.set_error(err);
        }
    }
}

impl<K, R> RdmaOperation<K, R>
where
    K: RdmaTask,
    R: Receiver<K::Output, DriverError>,
{
    /// Address of the whole record, typed as its leading table.
    fn erased(&mut self) -> *mut CompletionVtable {
        (self as *mut Self).cast()
    }

    unsafe fn on_stopped(vtable: *mut CompletionVtable) {
        // SAFETY: as in `on_value`.
        let this = unsafe { &mut *vtable.cast::<Self>() };
        this.task = None;
        if let Some(receiver) = this.receiver.take() {
            receiver.set_stopped();
        }
    }
}

impl<K, R> OperationState for RdmaOperation<K, R>
where
    K: RdmaTask,
    R: Receiver<K::Output, DriverError>,
{
    fn start(self: Pin<&mut Self>) {
        // SAFETY: fields are taken or written in place, the record never moves.
        let this = unsafe { self.get_unchecked_mut() };
        let stop_requested = match &this.receiver {
            Some(receiver) => receiver.stop_token().stop_requested(),
            None => return,
        };
        if stop_requested {
            let on_stopped = this.vtable.on_stopped;
            // SAFETY: the pointer is this record, whose first field is the table.
            unsafe { on_stopped(this.erased()) };
            return;
        }
        let Some(args) = this.args.take() else {
            let on_error = this.vtable.on_error;
            // SAFETY: as above.
            unsafe { on_error(this.erased(), DriverError::BadState) };
            return;
        };

        let task = match K::allocate(&this.rdma, args) {
            Ok(task) => task,
            Err(err) => {
                tracing::debug!(error = %err, "task allocation failed");
                let on_error = this.vtable.on_error;
                // SAFETY: as above.
                unsafe { on_error(this.erased(), err) };
                return;
            }
        };
        let handle = task.as_native_task().handle().clone();
        this.task = Some(task);
        this.submitted = Some(handle.clone());

        let submitted = handle
            .set_user_data(UserData::from_ptr(this.erased()))
            .and_then(|()| handle.submit());
        if let Err(err) = submitted {
            // Nothing was queued, so no callback will reach this record.
            let on_error = this.vtable.on_error;
            // SAFETY: as above.
            unsafe { on_error(this.erased(), err) };
        }
    }
}

fn operation_of(user_data: UserData) -> Option<*mut CompletionVtable> {
    let vtable = user_data.as_ptr::<CompletionVtable>();
    if vtable.is_null() {
        fatal::report("task completed without an operation", &DriverError::DriverFault);
        None
    } else {
        Some(vtable)
    }
}

/// Success callback shared by every task kind.
pub(crate) fn on_task_success(task: TaskHandle, user_data: UserData, _ctx: UserData) {
    drop(task);
    if let Some(vtable) = operation_of(user_data) {
        // SAFETY: only `RdmaOperation::start` attaches user data to tasks.
        unsafe { ((*vtable).on_value)(vtable) }
    }
}

/// Error callback shared by every task kind.
pub(crate) fn on_task_error(task: TaskHandle, user_data: UserData, _ctx: UserData) {
    let err = task.status().err().unwrap_or(DriverError::DriverFault);
    drop(task);
    if let Some(vtable) = operation_of(user_data) {
        // SAFETY: only `RdmaOperation::start` attaches user data to tasks.
        unsafe { ((*vtable).on_error)(vtable, err) }
    }
}
