//! Client core: inode table, directory caches, readahead, request tasks,
//! and the kernel-bridge adapter.

pub mod attr;
pub mod bridge;
pub mod client;
pub mod dircache;
pub mod inode;
pub mod readahead;
pub mod reply;
pub mod task;

pub use client::{ClientConfig, LookupCachePolicy, NfsClient};
pub use inode::ROOT_INO;
