//! Connection endpoints and the handshake sender.

use std::marker::PhantomPinned;
use std::pin::Pin;

use offload_driver::{ConnState, DriverError, DriverResult, NativeConnection, UserData};
use offload_runtime::{fatal, OperationState, Receiver, Sender};

use crate::rdma::Rdma;

/// An endpoint of an RDMA context. Dropping it disconnects.
pub struct RdmaConnection {
    native: NativeConnection,
    rdma: Rdma,
}

impl RdmaConnection {
    pub(crate) fn new(native: NativeConnection, rdma: Rdma) -> Self {
        Self { native, rdma }
    }

    pub fn id(&self) -> u64 {
        self.native.id()
    }

    pub fn state(&self) -> ConnState {
        self.native.state()
    }

    pub fn rdma(&self) -> &Rdma {
        &self.rdma
    }

    pub fn native(&self) -> &NativeConnection {
        &self.native
    }

    /// Disconnects now. Dropping the connection afterwards is a no-op.
    pub fn disconnect(&self) -> DriverResult<()> {
        self.native.disconnect()
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        if let Err(err) = self.native.disconnect() {
            fatal::report("disconnecting an rdma connection", &err);
        }
    }
}

impl std::fmt::Debug for RdmaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RdmaConnection").field(&self.native).finish()
    }
}

#[repr(C)]
pub(crate) struct ConnectionVtable {
    on_established: unsafe fn(*mut ConnectionVtable),
    on_failure: unsafe fn(*mut ConnectionVtable),
}

/// Applies a peer's descriptor to an exported endpoint and completes with
/// the established connection.
#[derive(Debug)]
pub struct ConnectSender {
    connection: RdmaConnection,
    remote_desc: Vec<u8>,
}

impl ConnectSender {
    pub(crate) fn new(connection: RdmaConnection, remote_desc: Vec<u8>) -> Self {
        Self {
            connection,
            remote_desc,
        }
    }
}

impl Sender for ConnectSender {
    type Output = RdmaConnection;
    type Error = DriverError;
    type Operation<R: Receiver<RdmaConnection, DriverError>> = ConnectOperation<R>;

    fn connect<R: Receiver<RdmaConnection, DriverError>>(self, receiver: R) -> ConnectOperation<R> {
        ConnectOperation {
            vtable: ConnectOperation::<R>::VTABLE,
            connection: Some(self.connection),
            endpoint: None,
            remote_desc: self.remote_desc,
            receiver: Some(receiver),
            _pin: PhantomPinned,
        }
    }
}

/// Handshake record. Its address is the endpoint's user data until the
/// connection is established or has failed.
#[repr(C)]
pub struct ConnectOperation<R> {
    vtable: ConnectionVtable,
    connection: Option<RdmaConnection>,
    /// Endpoint carrying this record as user data. Written before the
    /// descriptor is applied and only read afterwards, by `drop`.
    endpoint: Option<NativeConnection>,
    remote_desc: Vec<u8>,
    receiver: Option<R>,
    _pin: PhantomPinned,
}

impl<R> Drop for ConnectOperation<R> {
    fn drop(&mut self) {
        let record = UserData::from_ptr((self as *mut Self).cast::<ConnectionVtable>());
        if let Some(endpoint) = &self.endpoint {
            endpoint.withdraw_user_data(record);
        }
    }
}

impl<R: Receiver<RdmaConnection, DriverError>> ConnectOperation<R> {
    const VTABLE: ConnectionVtable = ConnectionVtable {
        on_established: Self::on_established,
        on_failure: Self::on_failure,
    };

    /// Detaches the endpoint from this record.
    fn take_parts(&mut self) -> (Option<RdmaConnection>, Option<R>) {
        let connection = self.connection.take();
        if let Some(connection) = &connection {
            connection.native.set_user_data(UserData::NULL);
        }
        (connection, self.receiver.take())
    }

    unsafe fn on_established(vtable: *mut ConnectionVtable) {
        // SAFETY: `vtable` is the first field of a started, pinned `Self`.
        let this = unsafe { &mut *vtable.cast::<Self>() };
        match this.take_parts() {
            (Some(connection), Some(receiver)) => {
                tracing::debug!(conn = connection.id(), peer = ?connection.native.peer_id(), "connection established");
                receiver.set_value(connection);
            }
            (_, Some(receiver)) => receiver.set_error(DriverError::BadState),
            _ => {}
        }
    }

    unsafe fn on_failure(vtable: *mut ConnectionVtable) {
        // SAFETY: as in `on_established`.
        let this = unsafe { &mut *vtable.cast::<Self>() };
        let (connection, receiver) = this.take_parts();
        if let Some(connection) = &connection {
            tracing::warn!(conn = connection.id(), "connection failed");
        }
        drop(connection);
        if let Some(receiver) = receiver {
            receiver.set_error(DriverError::ConnectionFailed);
        }
    }
}

impl<R: Receiver<RdmaConnection, DriverError>> OperationState for ConnectOperation<R> {
    fn start(self: Pin<&mut Self>) {
        // SAFETY: fields are taken or written in place, the record never moves.
        let this = unsafe { self.get_unchecked_mut() };
        let stop_requested = this
            .receiver
            .as_ref()
            .is_some_and(|receiver| receiver.stop_token().stop_requested());
        if stop_requested {
            let (connection, receiver) = this.take_parts();
            drop(connection);
            if let Some(receiver) = receiver {
                receiver.set_stopped();
            }
            return;
        }

        let remote_desc = std::mem::take(&mut this.remote_desc);
        let record: *mut ConnectionVtable = (this as *mut Self).cast();
        let Some(connection) = &this.connection else {
            return;
        };
        connection.native.set_user_data(UserData::from_ptr(record));
        let rdma = connection.rdma.clone();
        let native = connection.native.clone();
        this.endpoint = Some(native.clone());
        if let Err(err) = rdma.native().connect(&remote_desc, &native) {
            tracing::debug!(conn = native.id(), error = %err, "descriptor rejected");
            let (connection, receiver) = this.take_parts();
            drop(connection);
            if let Some(receiver) = receiver {
                receiver.set_error(err);
            }
        }
    }
}

fn handshake_of(conn: &NativeConnection, user_data: UserData) -> Option<*mut ConnectionVtable> {
    let vtable = user_data.as_ptr::<ConnectionVtable>();
    if vtable.is_null() {
        tracing::debug!(conn = conn.id(), state = ?conn.state(), "connection event with no pending handshake");
        None
    } else {
        Some(vtable)
    }
}

pub(crate) fn on_established(conn: &NativeConnection, user_data: UserData, _ctx: UserData) {
    if let Some(vtable) = handshake_of(conn, user_data) {
        // SAFETY: only `ConnectOperation::start` attaches user data to endpoints.
        unsafe { ((*vtable).on_established)(vtable) }
    }
}

pub(crate) fn on_failure(conn: &NativeConnection, user_data: UserData, _ctx: UserData) {
    if let Some(vtable) = handshake_of(conn, user_data) {
        // SAFETY: only `ConnectOperation::start` attaches user data to endpoints.
        unsafe { ((*vtable).on_failure)(vtable) }
    }
}

pub(crate) fn on_disconnect(conn: &NativeConnection, _user_data: UserData, _ctx: UserData) {
    tracing::debug!(conn = conn.id(), "connection closed");
}
