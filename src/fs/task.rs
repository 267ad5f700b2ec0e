//! Request tasks: the fixed-capacity slot pool and the retry/reply state
//! machine every RPC completion funnels through.
//!
//! Slots are preallocated and recycled in place. Acquisition blocks when
//! all slots are busy, which is the client's admission control: upcall
//! threads stall instead of queueing unbounded work. A task must receive
//! exactly one upstream reply; taking it out of its slot on completion
//! makes a second reply unrepresentable.

use std::ffi::OsString;
use std::sync::{Condvar, Mutex};

use bytes::Bytes;

use crate::rpc::proto::{NfsStat3, Sattr3};
use crate::rpc::transport::RpcStatus;

use super::reply::ReplySink;

/// Capacity of the slot pool; also the ceiling on in-flight requests.
pub const MAX_OUTSTANDING_RPC_TASKS: usize = 65536;

/// Maximum times one request may be re-sent after an error.
pub const MAX_ERRNO_RETRIES: u32 = 3;

/// Per-operation arguments, owned so they survive retries.
#[derive(Debug)]
pub enum TaskArgs {
    Lookup { parent: u64, name: OsString },
    Getattr { ino: u64 },
    Setattr { ino: u64, sattr: Sattr3 },
    Create { parent: u64, name: OsString, mode: u32 },
    Mkdir { parent: u64, name: OsString, mode: u32 },
    Unlink { parent: u64, name: OsString },
    Rmdir { parent: u64, name: OsString },
    Readdir { ino: u64, size: u32, cookie: u64 },
    Readdirplus { ino: u64, size: u32, cookie: u64 },
    Read { ino: u64, offset: u64, size: u32 },
    Readahead { ino: u64, offset: u64, size: u32 },
    Write { ino: u64, offset: u64, data: Bytes },
    Statfs { ino: u64 },
}

impl TaskArgs {
    /// Operation name for logging.
    pub fn optype(&self) -> &'static str {
        match self {
            Self::Lookup { .. } => "lookup",
            Self::Getattr { .. } => "getattr",
            Self::Setattr { .. } => "setattr",
            Self::Create { .. } => "create",
            Self::Mkdir { .. } => "mkdir",
            Self::Unlink { .. } => "unlink",
            Self::Rmdir { .. } => "rmdir",
            Self::Readdir { .. } => "readdir",
            Self::Readdirplus { .. } => "readdirplus",
            Self::Read { .. } => "read",
            Self::Readahead { .. } => "readahead",
            Self::Write { .. } => "write",
            Self::Statfs { .. } => "statfs",
        }
    }

    /// Whether re-sending this operation after a failure is safe.
    ///
    /// CREATE runs in unchecked mode and REMOVE/RMDIR/MKDIR observably
    /// change state, so NFS-level errors on those are terminal; transport
    /// errors may still be retried before the server saw the call.
    pub fn idempotent(&self) -> bool {
        !matches!(
            self,
            Self::Create { .. } | Self::Mkdir { .. } | Self::Unlink { .. } | Self::Rmdir { .. }
        )
    }
}

/// What a completion should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Success: materialize the result and reply.
    Done,
    /// Re-submit the same task.
    Retry,
    /// Reply upstream with this errno and free the task.
    Fail(i32),
}

/// One in-flight request.
pub struct RpcTask {
    pub args: TaskArgs,
    /// Reply channel; `None` for internal work (readahead) that has no
    /// upstream request behind it.
    pub reply: Option<Box<dyn ReplySink>>,
    retries: u32,
}

impl RpcTask {
    pub fn new(args: TaskArgs, reply: Option<Box<dyn ReplySink>>) -> Self {
        Self {
            args,
            reply,
            retries: 0,
        }
    }

    /// Classify an RPC completion.
    ///
    /// Transport failures and retryable NFS errors on idempotent
    /// operations are retried up to [`MAX_ERRNO_RETRIES`]; everything
    /// else resolves the request. Each retry is counted, bounding total
    /// submissions per request at `MAX_ERRNO_RETRIES + 1`.
    pub fn disposition(&mut self, rpc_status: RpcStatus, nfs_status: NfsStat3) -> Disposition {
        if rpc_status != RpcStatus::Success {
            if self.retries < MAX_ERRNO_RETRIES {
                self.retries += 1;
                return Disposition::Retry;
            }
            return Disposition::Fail(libc::EIO);
        }

        if nfs_status == NfsStat3::Ok {
            return Disposition::Done;
        }

        if self.args.idempotent() && self.retries < MAX_ERRNO_RETRIES && nfs_status.is_retryable()
        {
            self.retries += 1;
            return Disposition::Retry;
        }

        Disposition::Fail(nfs_status.to_errno())
    }

    pub fn is_retry(&self) -> bool {
        self.retries > 0
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Fixed-capacity pool of task slots with blocking acquisition.
pub struct TaskPool {
    slots: Box<[Mutex<Option<RpcTask>>]>,
    free: Mutex<Vec<u32>>,
    available: Condvar,
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
impl TaskPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_OUTSTANDING_RPC_TASKS)
    }

    /// Pool with a custom capacity; tests use small pools to exercise
    /// exhaustion.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= MAX_OUTSTANDING_RPC_TASKS);
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        // Popping from the back hands out low indices first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            available: Condvar::new(),
        }
    }

    /// Install `task` in a free slot, blocking until one exists. Returns
    /// the slot index used for all further access.
    pub fn acquire(&self, task: RpcTask) -> u32 {
        let mut free = self.free.lock().expect("poisoned");
        while free.is_empty() {
            free = self.available.wait(free).expect("poisoned");
        }
        let index = free.pop().unwrap_or_else(|| unreachable!("woken on empty pool"));
        drop(free);

        let previous = self.slots[index as usize]
            .lock()
            .expect("poisoned")
            .replace(task);
        debug_assert!(previous.is_none(), "slot {index} was reissued while busy");
        index
    }

    /// Run `f` against the live task in `index`.
    pub fn with_task<T>(&self, index: u32, f: impl FnOnce(&mut RpcTask) -> T) -> T {
        let mut slot = self.slots[index as usize].lock().expect("poisoned");
        let task = slot
            .as_mut()
            .unwrap_or_else(|| unreachable!("slot {index} accessed after release"));
        f(task)
    }

    /// Take the task out and recycle the slot, waking one blocked
    /// acquirer. The slot must not be touched again under this index.
    pub fn complete(&self, index: u32) -> RpcTask {
        let task = self.slots[index as usize]
            .lock()
            .expect("poisoned")
            .take()
            .unwrap_or_else(|| unreachable!("slot {index} completed twice"));
        self.free.lock().expect("poisoned").push(index);
        self.available.notify_one();
        task
    }

    /// Free slots remaining.
    pub fn free_count(&self) -> usize {
        self.free.lock().expect("poisoned").len()
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}
