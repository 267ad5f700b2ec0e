//! The seam between the client core and the RPC machinery.
//!
//! A transport owns one connection to the server and a service thread that
//! drives its replies. Completions are invoked on that service thread, so
//! they may run concurrently with new submissions from upcall threads.

use thiserror::Error;

use super::proto::{ProcCall, ProcReply};

/// Outcome of the RPC layer itself, before any NFS status is examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    /// The call reached the server and a reply was decoded.
    Success,
    /// The call never completed: connection failure, decode failure, or a
    /// server-side RPC rejection.
    Error,
}

/// Completion callback. Invoked exactly once per accepted submission, on a
/// transport service thread. The reply is `None` whenever the status is
/// not [`RpcStatus::Success`].
pub type OnDone = Box<dyn FnOnce(RpcStatus, Option<ProcReply>) + Send>;

/// Submission failure. The callback has *not* been taken over: it is
/// dropped, and the caller resubmits or gives up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The transport could not accept the call right now (e.g. buffer
    /// exhaustion). Worth retrying shortly on the same transport.
    #[error("transport temporarily unable to accept the call")]
    Transient,

    /// The connection is gone. Resubmit on a different connection.
    #[error("connection closed")]
    Closed,
}

/// One RPC connection to the NFS server.
pub trait NfsTransport: Send + Sync {
    /// Queue `call` for transmission. On `Ok(())`, `done` will be invoked
    /// exactly once from the transport's service thread. On `Err`, `done`
    /// is dropped without being invoked.
    fn submit(&self, call: &ProcCall, done: OnDone) -> Result<(), SubmitError>;

    /// Whether the connection is still usable. A transport whose service
    /// thread has exited reports false and is skipped by the pool.
    fn healthy(&self) -> bool {
        true
    }
}
