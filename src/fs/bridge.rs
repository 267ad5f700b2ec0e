//! fuser adapter: receives kernel upcalls, hands them to the client
//! dispatchers, and wraps fuser's reply objects in one-shot [`ReplySink`]s.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::TimeOrNow;
use tracing::debug_span;

use crate::rpc::proto::{FsstatRes, Nfstime3, Sattr3, TimeHow};

use super::attr::{FileStat, NFS_BLKSIZE};
use super::client::NfsClient;
use super::reply::{EntryOut, ReaddirOut, ReplySink};

/// The mounted filesystem: a thin shim over [`NfsClient`].
pub struct NfsFuse {
    client: Arc<NfsClient>,
}

impl NfsFuse {
    pub fn new(client: Arc<NfsClient>) -> Self {
        Self { client }
    }
}

fn fuse_attr(entry: &EntryOut) -> fuser::FileAttr {
    entry.stat.to_fuse(entry.ino)
}

// ── Reply sinks ─────────────────────────────────────────────────────────

struct EntrySink(fuser::ReplyEntry);

impl ReplySink for EntrySink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn entry(self: Box<Self>, entry: &EntryOut) {
        let ttl = if entry.ino == 0 {
            entry.entry_ttl
        } else {
            entry.attr_ttl
        };
        self.0.entry(&ttl, &fuse_attr(entry), entry.generation);
    }
}

struct AttrSink(fuser::ReplyAttr);

impl ReplySink for AttrSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn attr(self: Box<Self>, stat: &FileStat, ino: u64, ttl: Duration) {
        self.0.attr(&ttl, &stat.to_fuse(ino));
    }
}

struct CreateSink(fuser::ReplyCreate);

impl ReplySink for CreateSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn created(self: Box<Self>, entry: &EntryOut, fh: u64) {
        self.0
            .created(&entry.attr_ttl, &fuse_attr(entry), entry.generation, fh, 0);
    }
}

struct DataSink(fuser::ReplyData);

impl ReplySink for DataSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn data(self: Box<Self>, data: &[u8]) {
        self.0.data(data);
    }
}

struct WriteSink(fuser::ReplyWrite);

impl ReplySink for WriteSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn written(self: Box<Self>, count: u32) {
        self.0.written(count);
    }
}

struct EmptySink(fuser::ReplyEmpty);

impl ReplySink for EmptySink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn ok(self: Box<Self>) {
        self.0.ok();
    }
}

struct DirSink(fuser::ReplyDirectory);

impl ReplySink for DirSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn dir(self: Box<Self>, out: ReaddirOut) {
        let mut reply = self.0;
        for entry in &out.entries {
            if reply.add(entry.ino, entry.cookie as i64, entry.kind.into(), &entry.name) {
                break;
            }
        }
        reply.ok();
    }
}

struct DirPlusSink(fuser::ReplyDirectoryPlus);

impl ReplySink for DirPlusSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn dir_plus(self: Box<Self>, out: ReaddirOut) {
        let mut reply = self.0;
        for entry in &out.entries {
            let full = match &entry.entry {
                Some(e) => reply.add(
                    e.ino,
                    entry.cookie as i64,
                    &entry.name,
                    &e.attr_ttl,
                    &fuse_attr(e),
                    e.generation,
                ),
                // No handle came back for this name: let the kernel issue
                // its own LOOKUP.
                None => reply.add(
                    0,
                    entry.cookie as i64,
                    &entry.name,
                    &Duration::ZERO,
                    &FileStat::stub(entry.ino).to_fuse(entry.ino),
                    0,
                ),
            };
            if full {
                break;
            }
        }
        reply.ok();
    }
}

struct StatfsSink(fuser::ReplyStatfs);

impl ReplySink for StatfsSink {
    fn error(self: Box<Self>, errno: i32) {
        self.0.error(errno);
    }

    fn statfs(self: Box<Self>, stats: &FsstatRes) {
        let bsize = u64::from(NFS_BLKSIZE);
        self.0.statfs(
            stats.tbytes / bsize,
            stats.fbytes / bsize,
            stats.abytes / bsize,
            stats.tfiles,
            stats.ffiles,
            NFS_BLKSIZE,
            255,
            NFS_BLKSIZE,
        );
    }
}

// ── Upcall translation ──────────────────────────────────────────────────

fn nfstime(t: SystemTime) -> Nfstime3 {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    Nfstime3 {
        seconds: d.as_secs() as u32,
        nseconds: d.subsec_nanos(),
    }
}

fn time_how(t: Option<TimeOrNow>) -> TimeHow {
    match t {
        None => TimeHow::DontChange,
        Some(TimeOrNow::Now) => TimeHow::ServerTime,
        Some(TimeOrNow::SpecificTime(t)) => TimeHow::ClientTime(nfstime(t)),
    }
}

impl fuser::Filesystem for NfsFuse {
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let _span = debug_span!("lookup", parent, ?name).entered();
        self.client.lookup(parent, name, Box::new(EntrySink(reply)));
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        let _span = debug_span!("forget", ino, nlookup).entered();
        self.client.forget(ino, nlookup);
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let _span = debug_span!("getattr", ino).entered();
        self.client.getattr(ino, Box::new(AttrSink(reply)));
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let _span = debug_span!("setattr", ino).entered();
        let sattr = Sattr3 {
            mode: mode.map(|m| m & 0o7777),
            uid,
            gid,
            size,
            atime: time_how(atime),
            mtime: time_how(mtime),
        };
        self.client.setattr(ino, sattr, Box::new(AttrSink(reply)));
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let _span = debug_span!("mkdir", parent, ?name).entered();
        self.client
            .mkdir(parent, name, mode, Box::new(EntrySink(reply)));
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let _span = debug_span!("unlink", parent, ?name).entered();
        self.client.unlink(parent, name, Box::new(EmptySink(reply)));
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let _span = debug_span!("rmdir", parent, ?name).entered();
        self.client.rmdir(parent, name, Box::new(EmptySink(reply)));
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let _span = debug_span!("read", ino, offset, size).entered();
        self.client
            .read(ino, offset.max(0) as u64, size, Box::new(DataSink(reply)));
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let _span = debug_span!("write", ino, offset, len = data.len()).entered();
        self.client
            .write(ino, offset.max(0) as u64, data, Box::new(WriteSink(reply)));
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectory,
    ) {
        let _span = debug_span!("readdir", ino, offset).entered();
        // fuser does not expose the kernel's buffer size here; one page
        // is the conservative floor the kernel always accepts.
        self.client
            .readdir(ino, 4096, offset, Box::new(DirSink(reply)));
    }

    fn readdirplus(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectoryPlus,
    ) {
        let _span = debug_span!("readdirplus", ino, offset).entered();
        self.client
            .readdirplus(ino, 4096, offset, Box::new(DirPlusSink(reply)));
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let _span = debug_span!("create", parent, ?name).entered();
        self.client
            .create(parent, name, mode, Box::new(CreateSink(reply)));
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        let _span = debug_span!("statfs", ino).entered();
        self.client.statfs(ino, Box::new(StatfsSink(reply)));
    }
}
