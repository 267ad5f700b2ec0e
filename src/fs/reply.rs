//! Typed reply channel between the client core and the kernel bridge.
//!
//! Each upstream request carries exactly one sink, consumed by exactly
//! one reply, success or error. The bridge wraps the kernel's reply
//! objects in these; the test suite substitutes recording sinks to drive
//! the core without a mounted filesystem.

use std::ffi::OsString;
use std::time::Duration;

use tracing::error;

use super::attr::{FileKind, FileStat};
use crate::rpc::proto::FsstatRes;

/// Payload of a reply-entry: attributes bound to an upstream inode.
///
/// `ino == 0` is the negative entry: the name does not exist, and the
/// kernel may cache that fact for `entry_ttl`.
#[derive(Debug, Clone, Copy)]
pub struct EntryOut {
    pub ino: u64,
    pub generation: u64,
    pub stat: FileStat,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

impl EntryOut {
    pub fn negative(entry_ttl: Duration) -> Self {
        Self {
            ino: 0,
            generation: 0,
            stat: FileStat::stub(0),
            attr_ttl: Duration::ZERO,
            entry_ttl,
        }
    }
}

/// One directory entry in a readdir reply.
#[derive(Debug, Clone)]
pub struct DirEntryOut {
    pub ino: u64,
    pub cookie: u64,
    pub kind: FileKind,
    pub name: OsString,
    /// Present for readdirplus: full attributes plus a lookup reference
    /// the kernel now owns.
    pub entry: Option<EntryOut>,
}

/// Complete payload of a readdir/readdirplus reply.
#[derive(Debug, Clone, Default)]
pub struct ReaddirOut {
    pub entries: Vec<DirEntryOut>,
}

/// One-shot reply channel. Exactly one method is called per sink.
///
/// The default bodies flag a wiring bug: a dispatcher replying with a
/// shape its upstream request cannot carry.
pub trait ReplySink: Send {
    /// Reply with a negative errno's absolute value (e.g. `ENOENT`).
    fn error(self: Box<Self>, errno: i32);

    fn entry(self: Box<Self>, entry: &EntryOut) {
        let _ = entry;
        wrong_shape("entry");
    }

    fn attr(self: Box<Self>, stat: &FileStat, ino: u64, ttl: Duration) {
        let _ = (stat, ino, ttl);
        wrong_shape("attr");
    }

    fn created(self: Box<Self>, entry: &EntryOut, fh: u64) {
        let _ = (entry, fh);
        wrong_shape("created");
    }

    fn data(self: Box<Self>, data: &[u8]) {
        let _ = data;
        wrong_shape("data");
    }

    fn written(self: Box<Self>, count: u32) {
        let _ = count;
        wrong_shape("written");
    }

    fn dir(self: Box<Self>, out: ReaddirOut) {
        let _ = out;
        wrong_shape("dir");
    }

    fn dir_plus(self: Box<Self>, out: ReaddirOut) {
        let _ = out;
        wrong_shape("dir_plus");
    }

    fn statfs(self: Box<Self>, stats: &FsstatRes) {
        let _ = stats;
        wrong_shape("statfs");
    }

    fn ok(self: Box<Self>) {
        wrong_shape("ok");
    }
}

fn wrong_shape(what: &str) {
    debug_assert!(false, "reply shape `{what}` sent to a sink that cannot carry it");
    error!(what, "reply shape mismatch, dropping reply");
}
