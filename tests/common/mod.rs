#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs, dead_code)]

//! Shared test fixtures: a scripted in-memory transport and a recording
//! reply sink, so the client core can be driven without a server or a
//! mounted filesystem.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nfs_fs::fs::attr::FileStat;
use nfs_fs::fs::client::{ClientConfig, LookupCachePolicy, NfsClient};
use nfs_fs::fs::reply::{EntryOut, ReaddirOut, ReplySink};
use nfs_fs::rpc::pool::ConnectionPool;
use nfs_fs::rpc::proto::{Fattr3, Fh3, FsstatRes, Ftype3, Nfstime3, ProcCall, ProcReply};
use nfs_fs::rpc::transport::{NfsTransport, OnDone, RpcStatus, SubmitError};

pub type Responder = Box<dyn FnOnce(&ProcCall) -> (RpcStatus, Option<ProcReply>) + Send>;

/// Transport that answers from a script of one-shot responders, falling
/// back to an optional catch-all. Completions run synchronously on the
/// submitting thread, which the core must tolerate anyway (completions
/// may arrive on any transport thread).
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Responder>>,
    #[allow(clippy::type_complexity)]
    fallback: Mutex<Option<Box<dyn Fn(&ProcCall) -> (RpcStatus, Option<ProcReply>) + Send>>>,
    calls: Mutex<Vec<ProcCall>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, responder: Responder) {
        self.script.lock().unwrap().push_back(responder);
    }

    pub fn set_fallback(
        &self,
        f: impl Fn(&ProcCall) -> (RpcStatus, Option<ProcReply>) + Send + 'static,
    ) {
        *self.fallback.lock().unwrap() = Some(Box::new(f));
    }

    /// Every call observed so far.
    pub fn calls(&self) -> Vec<ProcCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl NfsTransport for MockTransport {
    fn submit(&self, call: &ProcCall, done: OnDone) -> Result<(), SubmitError> {
        self.calls.lock().unwrap().push(call.clone());
        let scripted = self.script.lock().unwrap().pop_front();
        let (status, reply) = match scripted {
            Some(responder) => responder(call),
            None => {
                let fallback = self.fallback.lock().unwrap();
                let f = fallback
                    .as_ref()
                    .unwrap_or_else(|| panic!("unscripted call: {call:?}"));
                f(call)
            }
        };
        done(status, reply);
        Ok(())
    }
}

/// What a sink observed; exactly one event per upstream request.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    Error(i32),
    Entry { ino: u64, fileid: u64 },
    Attr { ino: u64 },
    Created { ino: u64 },
    Data(Vec<u8>),
    Written(u32),
    Dir(Vec<(String, u64)>),
    DirPlus(Vec<(String, u64, u64)>),
    Statfs { tbytes: u64 },
    Ok,
}

pub struct RecordingSink {
    tx: mpsc::Sender<ReplyEvent>,
}

impl ReplySink for RecordingSink {
    fn error(self: Box<Self>, errno: i32) {
        self.tx.send(ReplyEvent::Error(errno)).unwrap();
    }

    fn entry(self: Box<Self>, entry: &EntryOut) {
        self.tx
            .send(ReplyEvent::Entry {
                ino: entry.ino,
                fileid: entry.stat.fileid,
            })
            .unwrap();
    }

    fn attr(self: Box<Self>, _stat: &FileStat, ino: u64, _ttl: Duration) {
        self.tx.send(ReplyEvent::Attr { ino }).unwrap();
    }

    fn created(self: Box<Self>, entry: &EntryOut, _fh: u64) {
        self.tx.send(ReplyEvent::Created { ino: entry.ino }).unwrap();
    }

    fn data(self: Box<Self>, data: &[u8]) {
        self.tx.send(ReplyEvent::Data(data.to_vec())).unwrap();
    }

    fn written(self: Box<Self>, count: u32) {
        self.tx.send(ReplyEvent::Written(count)).unwrap();
    }

    fn dir(self: Box<Self>, out: ReaddirOut) {
        let entries = out
            .entries
            .iter()
            .map(|e| (e.name.to_string_lossy().into_owned(), e.cookie))
            .collect();
        self.tx.send(ReplyEvent::Dir(entries)).unwrap();
    }

    fn dir_plus(self: Box<Self>, out: ReaddirOut) {
        let entries = out
            .entries
            .iter()
            .map(|e| {
                (
                    e.name.to_string_lossy().into_owned(),
                    e.cookie,
                    e.entry.as_ref().map_or(0, |p| p.ino),
                )
            })
            .collect();
        self.tx.send(ReplyEvent::DirPlus(entries)).unwrap();
    }

    fn statfs(self: Box<Self>, stats: &FsstatRes) {
        self.tx
            .send(ReplyEvent::Statfs {
                tbytes: stats.tbytes,
            })
            .unwrap();
    }

    fn ok(self: Box<Self>) {
        self.tx.send(ReplyEvent::Ok).unwrap();
    }
}

/// A one-shot sink plus the receiver observing it.
pub fn sink() -> (Box<dyn ReplySink>, mpsc::Receiver<ReplyEvent>) {
    let (tx, rx) = mpsc::channel();
    (Box::new(RecordingSink { tx }), rx)
}

/// Receive the single reply an operation must have produced, and assert
/// a second one never arrives.
pub fn one_reply(rx: &mpsc::Receiver<ReplyEvent>) -> ReplyEvent {
    let event = rx
        .recv_timeout(Duration::from_secs(1))
        .expect("operation produced no reply");
    assert!(
        rx.try_recv().is_err(),
        "operation produced more than one reply"
    );
    event
}

pub fn root_fh() -> Fh3 {
    Fh3::new(vec![0xab; 16]).unwrap()
}

pub fn fh(tag: u8) -> Fh3 {
    Fh3::new(vec![tag; 12]).unwrap()
}

pub fn fattr(fileid: u64, ftype: Ftype3, size: u64) -> Fattr3 {
    let t = Nfstime3 {
        seconds: 1_700_000_000,
        nseconds: 0,
    };
    Fattr3 {
        ftype,
        mode: 0o644,
        nlink: 1,
        uid: 1000,
        gid: 1000,
        size,
        used: size,
        rdev: (0, 0),
        fsid: 7,
        fileid,
        atime: t,
        mtime: t,
        ctime: t,
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        actimeo: Duration::from_secs(60),
        readahead_kib: 1024,
        lookup_cache: LookupCachePolicy::All,
        dircache_max_bytes: 1024 * 1024 * 1024,
    }
}

pub fn test_client(transport: &Arc<MockTransport>, cfg: ClientConfig) -> Arc<NfsClient> {
    let pool = ConnectionPool::from_transports(
        vec![Arc::clone(transport) as Arc<dyn NfsTransport>],
        root_fh(),
    );
    NfsClient::new(pool, cfg)
}
