//! User-space NFSv3 client exposing a remote export through FUSE.
//!
//! The crate splits into the downstream RPC surface ([`rpc`]: wire types,
//! transport, connection pool) and the client core ([`fs`]: inode table,
//! directory caches, readahead, request tasks, and the fuser adapter).
//! The binary in `main.rs` wires configuration, logging, and the daemon
//! lifecycle around them.

pub mod app_config;
pub mod daemon;
pub mod fs;
pub mod rpc;
pub mod term;
pub mod trc;
