//! Downstream RPC surface: wire types, transport seam, TCP backend, and
//! the connection pool.

pub mod pool;
pub mod proto;
pub mod tcp;
pub mod transport;
pub mod xdr;

pub use pool::ConnectionPool;
pub use transport::{NfsTransport, OnDone, RpcStatus, SubmitError};
