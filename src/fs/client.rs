//! The NFS client core: per-operation dispatchers and result
//! materialization.
//!
//! Every upstream request takes a task slot, is built into an NFS call,
//! and submitted on one of the pool's connections. Completions arrive on
//! transport service threads and funnel through the task's retry machine:
//! a retry re-enters the dispatcher with the same slot, success
//! materializes into the inode table and directory caches, and exactly
//! one reply reaches the kernel bridge either way.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::rpc::pool::ConnectionPool;
use crate::rpc::proto::{
    CreateArgs, CreateRes, DirOpArgs, Fattr3, FsstatArgs, GetattrArgs, LookupRes, NfsStat3,
    ProcCall, ProcReply, ReadArgs, ReaddirArgs, ReaddirplusArgs, ReaddirplusEntry, ReadRes,
    Sattr3, SetattrArgs, WriteArgs,
};
use crate::rpc::transport::{OnDone, RpcStatus, SubmitError};

use super::attr::{FileKind, FileStat};
use super::dircache::{DirCache, DirEntry, DnlcLookup};
use super::inode::{InodeTable, NfsInode};
use super::readahead::RaState;
use super::reply::{DirEntryOut, EntryOut, ReaddirOut, ReplySink};
use super::task::{Disposition, RpcTask, TaskArgs, TaskPool};

/// Largest single readahead read.
const RA_CHUNK_MAX: u64 = 256 * 1024;

/// Floor on the enumeration batch requested from the server.
const READDIR_MIN_FETCH: u32 = 8192;

/// `fuse_dirent` header size; names are padded to 8 past it.
const DIRENT_HEADER: usize = 24;
/// `fuse_direntplus` header size (entry_out + dirent).
const DIRENTPLUS_HEADER: usize = 152;

/// DNLC usage policy (the `lookupcache` mount option).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupCachePolicy {
    /// Serve positive and confirmed-negative lookups from cache.
    #[default]
    All,
    /// Serve only positive lookups from cache.
    Positive,
    /// Never answer lookups from cache.
    Off,
}

/// Client-side tunables, distilled from the mount configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attribute and confirmed-directory validity window.
    pub actimeo: Duration,
    /// Per-file readahead window in KiB.
    pub readahead_kib: u64,
    /// DNLC policy.
    pub lookup_cache: LookupCachePolicy,
    /// Per-directory cache soft cap in bytes.
    pub dircache_max_bytes: u64,
}

/// The client core. One per mounted export.
pub struct NfsClient {
    pool: ConnectionPool,
    tasks: TaskPool,
    inodes: InodeTable,
    cfg: ClientConfig,
}

impl NfsClient {
    pub fn new(pool: ConnectionPool, cfg: ClientConfig) -> Arc<Self> {
        let inodes = InodeTable::new(pool.root_fh().clone(), cfg.actimeo);
        Arc::new(Self {
            pool,
            tasks: TaskPool::new(),
            inodes,
            cfg,
        })
    }

    /// The process-wide inode table.
    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// The task slot pool.
    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    fn dircache_of<'a>(&self, inode: &'a NfsInode) -> &'a DirCache {
        inode.dircache(self.cfg.actimeo, self.cfg.dircache_max_bytes)
    }

    fn readahead_of<'a>(&self, inode: &'a NfsInode) -> &'a RaState {
        inode.readahead(
            self.cfg
                .readahead_kib
                .clamp(super::readahead::MIN_RA_KIB, super::readahead::MAX_RA_KIB),
        )
    }

    // ── Upstream operations ─────────────────────────────────────────────

    /// LOOKUP: DNLC fast path, then `LOOKUP3`.
    pub fn lookup(self: &Arc<Self>, parent: u64, name: &OsStr, reply: Box<dyn ReplySink>) {
        if self.cfg.lookup_cache != LookupCachePolicy::Off {
            if let Some(parent_inode) = self.inodes.get(parent) {
                if let Some(dc) = parent_inode.dircache_opt() {
                    match dc.dnlc_lookup(name) {
                        DnlcLookup::Positive(inode) => {
                            if let Some(stat) = inode.stat_if_fresh() {
                                trace!(parent, ?name, ino = inode.fuse_ino(), "dnlc hit");
                                inode
                                    .forget_expected
                                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                reply.entry(&self.entry_out(inode.fuse_ino(), stat));
                                return;
                            }
                            // Attributes went stale; give the reference
                            // back and revalidate over the wire.
                            self.inodes.decref(&inode);
                        }
                        DnlcLookup::Miss {
                            negative_confirmed: true,
                        } if self.cfg.lookup_cache == LookupCachePolicy::All => {
                            trace!(parent, ?name, "confirmed negative lookup");
                            reply.entry(&EntryOut::negative(self.cfg.actimeo));
                            return;
                        }
                        DnlcLookup::NameOnly | DnlcLookup::Miss { .. } => {}
                    }
                }
            }
        }

        self.start_task(
            TaskArgs::Lookup {
                parent,
                name: name.to_owned(),
            },
            Some(reply),
        );
    }

    /// GETATTR: always revalidates over the wire.
    pub fn getattr(self: &Arc<Self>, ino: u64, reply: Box<dyn ReplySink>) {
        self.start_task(TaskArgs::Getattr { ino }, Some(reply));
    }

    /// SETATTR with the given settable fields.
    pub fn setattr(self: &Arc<Self>, ino: u64, sattr: Sattr3, reply: Box<dyn ReplySink>) {
        self.start_task(TaskArgs::Setattr { ino, sattr }, Some(reply));
    }

    /// CREATE (unchecked mode).
    pub fn create(
        self: &Arc<Self>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        reply: Box<dyn ReplySink>,
    ) {
        self.start_task(
            TaskArgs::Create {
                parent,
                name: name.to_owned(),
                mode,
            },
            Some(reply),
        );
    }

    /// MKDIR.
    pub fn mkdir(
        self: &Arc<Self>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        reply: Box<dyn ReplySink>,
    ) {
        self.start_task(
            TaskArgs::Mkdir {
                parent,
                name: name.to_owned(),
                mode,
            },
            Some(reply),
        );
    }

    /// REMOVE.
    pub fn unlink(self: &Arc<Self>, parent: u64, name: &OsStr, reply: Box<dyn ReplySink>) {
        self.start_task(
            TaskArgs::Unlink {
                parent,
                name: name.to_owned(),
            },
            Some(reply),
        );
    }

    /// RMDIR.
    pub fn rmdir(self: &Arc<Self>, parent: u64, name: &OsStr, reply: Box<dyn ReplySink>) {
        self.start_task(
            TaskArgs::Rmdir {
                parent,
                name: name.to_owned(),
            },
            Some(reply),
        );
    }

    /// READDIR: serve the slice from cache when it is covered, otherwise
    /// enumerate from the server.
    pub fn readdir(self: &Arc<Self>, ino: u64, size: u32, offset: i64, reply: Box<dyn ReplySink>) {
        let Some(inode) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if inode.kind() != FileKind::Directory {
            reply.error(libc::ENOTDIR);
            return;
        }
        let cookie = offset as u64;
        let dc = self.dircache_of(&inode);
        // Generous cap; byte-exact packing trims below.
        if let Some((entries, _eof)) = dc.serve(cookie, size as usize / DIRENT_HEADER + 1) {
            trace!(ino, cookie, served = entries.len(), "readdir from cache");
            reply.dir(self.pack_readdir(&entries, size));
            return;
        }

        self.start_task(TaskArgs::Readdir { ino, size, cookie }, Some(reply));
    }

    /// READDIRPLUS: like readdir, but entries carry attributes and take a
    /// lookup reference each.
    pub fn readdirplus(
        self: &Arc<Self>,
        ino: u64,
        size: u32,
        offset: i64,
        reply: Box<dyn ReplySink>,
    ) {
        let Some(inode) = self.inodes.get(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if inode.kind() != FileKind::Directory {
            reply.error(libc::ENOTDIR);
            return;
        }
        let cookie = offset as u64;
        let dc = self.dircache_of(&inode);
        if let Some((entries, _eof)) = dc.serve(cookie, size as usize / DIRENTPLUS_HEADER + 1) {
            // Attribute stubs cannot answer readdirplus; fall through to
            // the server unless every cached entry carries an inode.
            if entries.iter().all(|e| e.inode.is_some()) {
                trace!(ino, cookie, served = entries.len(), "readdirplus from cache");
                reply.dir_plus(self.pack_readdirplus(&entries, size));
                return;
            }
        }

        self.start_task(TaskArgs::Readdirplus { ino, size, cookie }, Some(reply));
    }

    /// READ. Feeds the readahead predictor and schedules readahead reads
    /// behind the application read.
    pub fn read(self: &Arc<Self>, ino: u64, offset: u64, size: u32, reply: Box<dyn ReplySink>) {
        let inode = self.inodes.get(ino);
        if let Some(inode) = &inode {
            if inode.kind() == FileKind::Regular && size > 0 {
                self.readahead_of(inode)
                    .on_application_read(offset, u64::from(size));
            }
        }

        self.start_task(TaskArgs::Read { ino, offset, size }, Some(reply));

        if let Some(inode) = &inode {
            if inode.kind() == FileKind::Regular {
                self.issue_readahead(inode);
            }
        }
    }

    /// WRITE. Data is copied so it survives retries.
    pub fn write(self: &Arc<Self>, ino: u64, offset: u64, data: &[u8], reply: Box<dyn ReplySink>) {
        self.start_task(
            TaskArgs::Write {
                ino,
                offset,
                data: Bytes::copy_from_slice(data),
            },
            Some(reply),
        );
    }

    /// STATFS via `FSSTAT3`.
    pub fn statfs(self: &Arc<Self>, ino: u64, reply: Box<dyn ReplySink>) {
        self.start_task(TaskArgs::Statfs { ino }, Some(reply));
    }

    /// FORGET: drop kernel-bridge references.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    // ── Readahead scheduling ────────────────────────────────────────────

    fn issue_readahead(self: &Arc<Self>, inode: &Arc<NfsInode>) {
        let ra = self.readahead_of(inode);
        let chunk = ra.window().min(RA_CHUNK_MAX);
        // One application read schedules at most a window's worth; the
        // in-flight cap inside `get_next_ra` bounds the total either way.
        let max_new = (ra.window() / chunk).max(1);
        for _ in 0..max_new {
            let offset = ra.get_next_ra(chunk);
            if offset == 0 {
                break;
            }
            trace!(ino = inode.fuse_ino(), offset, chunk, "scheduling readahead");
            self.start_task(
                TaskArgs::Readahead {
                    ino: inode.fuse_ino(),
                    offset,
                    size: chunk as u32,
                },
                None,
            );
        }
    }

    // ── Submission ──────────────────────────────────────────────────────

    fn start_task(self: &Arc<Self>, args: TaskArgs, reply: Option<Box<dyn ReplySink>>) {
        let index = self.tasks.acquire(RpcTask::new(args, reply));
        self.submit_task(index);
    }

    /// Build the call for the slot and hand it to a connection. Loops on
    /// transient submission failures; when every connection refuses, the
    /// failure is routed through the normal completion path so the retry
    /// bound still applies.
    fn submit_task(self: &Arc<Self>, index: u32) {
        let call = match self.tasks.with_task(index, |t| self.build_call(&t.args)) {
            Ok(call) => call,
            Err(errno) => {
                self.finish_error(index, errno);
                return;
            }
        };

        let mut transient_attempts = 0u64;
        let mut closed_in_a_row = 0usize;
        loop {
            let client = Arc::clone(self);
            let done: OnDone = Box::new(move |rpc, reply| client.task_done(index, rpc, reply));
            match self.pool.get_context().submit(&call, done) {
                Ok(()) => return,
                Err(SubmitError::Transient) => {
                    closed_in_a_row = 0;
                    transient_attempts += 1;
                    if transient_attempts % 1000 == 0 {
                        warn!(index, attempts = transient_attempts, "rpc submission still refused");
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(SubmitError::Closed) => {
                    closed_in_a_row += 1;
                    if closed_in_a_row >= self.pool.len() {
                        self.task_done(index, RpcStatus::Error, None);
                        return;
                    }
                }
            }
        }
    }

    fn build_call(&self, args: &TaskArgs) -> Result<ProcCall, i32> {
        let fh_of = |ino: u64| {
            self.inodes
                .get(ino)
                .map(|inode| inode.fh().clone())
                .ok_or(libc::ESTALE)
        };
        let name_of = |name: &OsString| name.as_bytes().to_vec();

        Ok(match args {
            TaskArgs::Lookup { parent, name } => ProcCall::Lookup(DirOpArgs {
                dir: fh_of(*parent)?,
                name: name_of(name),
            }),
            TaskArgs::Getattr { ino } => ProcCall::Getattr(GetattrArgs {
                object: fh_of(*ino)?,
            }),
            TaskArgs::Setattr { ino, sattr } => ProcCall::Setattr(SetattrArgs {
                object: fh_of(*ino)?,
                new_attributes: *sattr,
            }),
            TaskArgs::Create { parent, name, mode } => ProcCall::Create(CreateArgs {
                dir: fh_of(*parent)?,
                name: name_of(name),
                attributes: Sattr3 {
                    mode: Some(*mode & 0o7777),
                    ..Sattr3::default()
                },
            }),
            TaskArgs::Mkdir { parent, name, mode } => ProcCall::Mkdir(CreateArgs {
                dir: fh_of(*parent)?,
                name: name_of(name),
                attributes: Sattr3 {
                    mode: Some(*mode & 0o7777),
                    ..Sattr3::default()
                },
            }),
            TaskArgs::Unlink { parent, name } => ProcCall::Remove(DirOpArgs {
                dir: fh_of(*parent)?,
                name: name_of(name),
            }),
            TaskArgs::Rmdir { parent, name } => ProcCall::Rmdir(DirOpArgs {
                dir: fh_of(*parent)?,
                name: name_of(name),
            }),
            TaskArgs::Readdir { ino, size, cookie } => {
                let verifier = self.enumeration_verifier(*ino, *cookie);
                ProcCall::Readdir(ReaddirArgs {
                    dir: fh_of(*ino)?,
                    cookie: *cookie,
                    verifier,
                    count: (*size).max(READDIR_MIN_FETCH),
                })
            }
            TaskArgs::Readdirplus { ino, size, cookie } => {
                let verifier = self.enumeration_verifier(*ino, *cookie);
                let dircount = (*size).max(READDIR_MIN_FETCH);
                ProcCall::Readdirplus(ReaddirplusArgs {
                    dir: fh_of(*ino)?,
                    cookie: *cookie,
                    verifier,
                    dircount,
                    maxcount: dircount.saturating_mul(4),
                })
            }
            TaskArgs::Read { ino, offset, size } | TaskArgs::Readahead { ino, offset, size } => {
                ProcCall::Read(ReadArgs {
                    file: fh_of(*ino)?,
                    offset: *offset,
                    count: *size,
                })
            }
            TaskArgs::Write { ino, offset, data } => ProcCall::Write(WriteArgs {
                file: fh_of(*ino)?,
                offset: *offset,
                data: data.clone(),
            }),
            TaskArgs::Statfs { ino } => ProcCall::Fsstat(FsstatArgs {
                root: fh_of(*ino)?,
            }),
        })
    }

    /// A fresh scan (cookie 0) must carry a zero verifier; resumed scans
    /// echo the verifier the server handed out.
    fn enumeration_verifier(&self, ino: u64, cookie: u64) -> [u8; 8] {
        if cookie == 0 {
            return [0; 8];
        }
        self.inodes
            .get(ino)
            .and_then(|inode| inode.dircache_opt().map(DirCache::verifier))
            .unwrap_or([0; 8])
    }

    // ── Completion ──────────────────────────────────────────────────────

    /// Every RPC completion enters here, on a transport service thread.
    fn task_done(self: &Arc<Self>, index: u32, rpc_status: RpcStatus, reply: Option<ProcReply>) {
        // Missing reply on a successful call cannot happen; classify it
        // as a server fault like any other mangled completion.
        let nfs_status = reply
            .as_ref()
            .map_or(NfsStat3::Serverfault, ProcReply::status);

        // A clean NOENT on lookup is not a failure: reply success with a
        // zero inode so the kernel can cache the absence.
        if rpc_status == RpcStatus::Success && nfs_status == NfsStat3::Noent {
            let is_lookup = self
                .tasks
                .with_task(index, |t| matches!(t.args, TaskArgs::Lookup { .. }));
            if is_lookup {
                self.finish_lookup_negative(index);
                return;
            }
        }

        let disposition = self
            .tasks
            .with_task(index, |t| t.disposition(rpc_status, nfs_status));
        match disposition {
            Disposition::Retry => {
                debug!(index, ?rpc_status, ?nfs_status, "retrying task");
                self.submit_task(index);
            }
            Disposition::Fail(errno) => {
                debug!(index, ?rpc_status, ?nfs_status, errno, "task failed");
                self.finish_error(index, errno);
            }
            Disposition::Done => match reply {
                Some(reply) => self.materialize(index, reply),
                None => self.finish_error(index, libc::EIO),
            },
        }
    }

    /// Resolve the task with an error. Internal readahead settles its
    /// window accounting instead of replying.
    fn finish_error(&self, index: u32, errno: i32) {
        let task = self.tasks.complete(index);
        match &task.args {
            TaskArgs::Readahead { ino, offset, size } => {
                self.settle_readahead(*ino, *offset, u64::from(*size));
            }
            _ => {
                if let Some(sink) = task.reply {
                    sink.error(errno);
                }
            }
        }
    }

    fn settle_readahead(&self, ino: u64, offset: u64, size: u64) {
        if let Some(inode) = self.inodes.get(ino) {
            self.readahead_of(&inode).on_readahead_complete(offset, size);
        }
    }

    fn finish_lookup_negative(&self, index: u32) {
        let task = self.tasks.complete(index);
        let Some(sink) = task.reply else { return };
        match self.cfg.lookup_cache {
            LookupCachePolicy::All => sink.entry(&EntryOut::negative(self.cfg.actimeo)),
            _ => sink.error(libc::ENOENT),
        }
    }

    fn entry_out(&self, ino: u64, stat: FileStat) -> EntryOut {
        EntryOut {
            ino,
            generation: 0,
            stat,
            attr_ttl: self.cfg.actimeo,
            entry_ttl: self.cfg.actimeo,
        }
    }

    /// Success path: route the decoded reply to the per-operation
    /// completion. Shape mismatches resolve as I/O errors rather than
    /// panicking a service thread.
    fn materialize(self: &Arc<Self>, index: u32, reply: ProcReply) {
        match reply {
            ProcReply::Getattr(_, Some(res)) => self.finish_getattr(index, &res.attributes),
            ProcReply::Setattr(_, Some(res)) => self.finish_setattr(index, res.attributes.as_ref()),
            ProcReply::Lookup(_, Some(res)) => self.finish_lookup(index, &res),
            ProcReply::Read(_, Some(res)) => self.finish_read(index, &res),
            ProcReply::Write(_, Some(res)) => {
                self.finish_write(index, res.attributes.as_ref(), res.count);
            }
            ProcReply::Create(_, Some(res)) | ProcReply::Mkdir(_, Some(res)) => {
                self.finish_create(index, &res);
            }
            ProcReply::Remove(_, Some(_)) | ProcReply::Rmdir(_, Some(_)) => {
                self.finish_remove(index);
            }
            ProcReply::Readdir(_, Some(res)) => self.finish_readdir(index, res),
            ProcReply::Readdirplus(_, Some(res)) => self.finish_readdirplus(index, res),
            ProcReply::Fsstat(_, Some(res)) => {
                let task = self.tasks.complete(index);
                if let Some(sink) = task.reply {
                    sink.statfs(&res);
                }
            }
            other => {
                warn!(index, reply = ?other, "reply shape does not match the task");
                self.finish_error(index, libc::EIO);
            }
        }
    }

    fn finish_getattr(&self, index: u32, attributes: &Fattr3) {
        let task = self.tasks.complete(index);
        let TaskArgs::Getattr { ino } = task.args else {
            if let Some(sink) = task.reply {
                sink.error(libc::EIO);
            }
            return;
        };
        let stat = FileStat::from(attributes);
        if let Some(inode) = self.inodes.get(ino) {
            inode.update_stat(stat, self.cfg.actimeo);
        }
        if let Some(sink) = task.reply {
            sink.attr(&stat, ino, self.cfg.actimeo);
        }
    }

    fn finish_setattr(&self, index: u32, attributes: Option<&Fattr3>) {
        let task = self.tasks.complete(index);
        let TaskArgs::Setattr { ino, .. } = task.args else {
            if let Some(sink) = task.reply {
                sink.error(libc::EIO);
            }
            return;
        };
        let inode = self.inodes.get(ino);
        let stat = match (attributes, &inode) {
            (Some(attributes), _) => {
                let stat = FileStat::from(attributes);
                if let Some(inode) = &inode {
                    inode.update_stat(stat, self.cfg.actimeo);
                }
                stat
            }
            // Server skipped post-op attributes; answer from cache.
            (None, Some(inode)) => inode.stat(),
            (None, None) => {
                if let Some(sink) = task.reply {
                    sink.error(libc::ESTALE);
                }
                return;
            }
        };
        if let Some(sink) = task.reply {
            sink.attr(&stat, ino, self.cfg.actimeo);
        }
    }

    fn finish_lookup(&self, index: u32, res: &LookupRes) {
        let task = self.tasks.complete(index);
        let TaskArgs::Lookup { parent, name } = task.args else {
            if let Some(sink) = task.reply {
                sink.error(libc::EIO);
            }
            return;
        };
        let Some(sink) = task.reply else { return };

        let Some(attributes) = &res.attributes else {
            // Without post-op attributes we cannot build a reply-entry.
            sink.error(libc::EIO);
            return;
        };
        let stat = FileStat::from(attributes);
        let inode = self.inodes.get_or_create(&res.object, stat);
        self.inodes.incref(&inode);

        if let Some(parent_inode) = self.inodes.get(parent) {
            if let Some(dir_attributes) = &res.dir_attributes {
                parent_inode.update_stat(FileStat::from(dir_attributes), self.cfg.actimeo);
            }
            if self.cfg.lookup_cache != LookupCachePolicy::Off
                && parent_inode.kind() == FileKind::Directory
            {
                self.dircache_of(&parent_inode)
                    .dnlc_add(&name, &inode, &self.inodes);
            }
        }

        sink.entry(&self.entry_out(inode.fuse_ino(), stat));
    }

    fn finish_create(&self, index: u32, res: &CreateRes) {
        let task = self.tasks.complete(index);
        let (parent, name, is_create) = match task.args {
            TaskArgs::Create { parent, name, .. } => (parent, name, true),
            TaskArgs::Mkdir { parent, name, .. } => (parent, name, false),
            _ => {
                if let Some(sink) = task.reply {
                    sink.error(libc::EIO);
                }
                return;
            }
        };
        let Some(sink) = task.reply else { return };

        let (Some(object), Some(attributes)) = (&res.object, &res.attributes) else {
            // The server is allowed to omit the handle; this client
            // would need a LOOKUP round to recover it. Treat as failure.
            sink.error(libc::EIO);
            return;
        };

        let stat = FileStat::from(attributes);
        let inode = self.inodes.get_or_create(object, stat);
        self.inodes.incref(&inode);

        if self.cfg.lookup_cache != LookupCachePolicy::Off {
            if let Some(parent_inode) = self.inodes.get(parent) {
                if parent_inode.kind() == FileKind::Directory {
                    self.dircache_of(&parent_inode)
                        .dnlc_add(&name, &inode, &self.inodes);
                }
            }
        }

        let entry = self.entry_out(inode.fuse_ino(), stat);
        if is_create {
            sink.created(&entry, 0);
        } else {
            sink.entry(&entry);
        }
    }

    fn finish_remove(&self, index: u32) {
        let task = self.tasks.complete(index);
        let (parent, name) = match &task.args {
            TaskArgs::Unlink { parent, name } | TaskArgs::Rmdir { parent, name } => {
                (*parent, name.clone())
            }
            _ => {
                if let Some(sink) = task.reply {
                    sink.error(libc::EIO);
                }
                return;
            }
        };

        if let Some(parent_inode) = self.inodes.get(parent) {
            if let Some(dc) = parent_inode.dircache_opt() {
                dc.remove_name(&name, &self.inodes);
            }
        }

        if let Some(sink) = task.reply {
            sink.ok();
        }
    }

    fn finish_read(&self, index: u32, res: &ReadRes) {
        let task = self.tasks.complete(index);
        match &task.args {
            TaskArgs::Read { ino, .. } => {
                if let (Some(attributes), Some(inode)) = (&res.attributes, self.inodes.get(*ino)) {
                    inode.update_stat(FileStat::from(attributes), self.cfg.actimeo);
                }
                if let Some(sink) = task.reply {
                    sink.data(&res.data);
                }
            }
            TaskArgs::Readahead { ino, offset, size } => {
                trace!(ino, offset, "readahead complete");
                self.settle_readahead(*ino, *offset, u64::from(*size));
            }
            _ => {
                if let Some(sink) = task.reply {
                    sink.error(libc::EIO);
                }
            }
        }
    }

    fn finish_write(&self, index: u32, attributes: Option<&Fattr3>, count: u32) {
        let task = self.tasks.complete(index);
        let TaskArgs::Write { ino, .. } = task.args else {
            if let Some(sink) = task.reply {
                sink.error(libc::EIO);
            }
            return;
        };
        if let (Some(attributes), Some(inode)) = (attributes, self.inodes.get(ino)) {
            inode.update_stat(FileStat::from(attributes), self.cfg.actimeo);
        }
        if let Some(sink) = task.reply {
            sink.written(count);
        }
    }

    // ── Directory enumeration ───────────────────────────────────────────

    fn finish_readdir(&self, index: u32, res: crate::rpc::proto::ReaddirRes) {
        let task = self.tasks.complete(index);
        let TaskArgs::Readdir { ino, size, cookie } = task.args else {
            if let Some(sink) = task.reply {
                sink.error(libc::EIO);
            }
            return;
        };
        let Some(sink) = task.reply else { return };
        let Some(dir) = self.inodes.get(ino) else {
            sink.error(libc::ESTALE);
            return;
        };

        if let Some(dir_attributes) = &res.dir_attributes {
            dir.update_stat(FileStat::from(dir_attributes), self.cfg.actimeo);
        }

        let dc = self.dircache_of(&dir);
        dc.set_verifier(res.verifier);

        let mut served = Vec::with_capacity(res.entries.len());
        for entry in &res.entries {
            let name = OsString::from_vec(entry.name.clone());
            dc.remove_cookie(entry.cookie, &self.inodes);
            dc.add_stub(name.clone(), entry.cookie, entry.fileid, &self.inodes);
            served.push(DirEntry {
                name,
                cookie: entry.cookie,
                stat: FileStat::stub(entry.fileid),
                has_stat: false,
                inode: None,
            });
        }

        if res.eof {
            let last = res.entries.last().map_or(cookie, |e| e.cookie);
            dc.set_eof(last);
        }

        sink.dir(self.pack_readdir(&served, size));
    }

    fn finish_readdirplus(&self, index: u32, res: crate::rpc::proto::ReaddirplusRes) {
        let task = self.tasks.complete(index);
        let TaskArgs::Readdirplus { ino, size, cookie } = task.args else {
            if let Some(sink) = task.reply {
                sink.error(libc::EIO);
            }
            return;
        };
        let Some(sink) = task.reply else { return };
        let Some(dir) = self.inodes.get(ino) else {
            sink.error(libc::ESTALE);
            return;
        };

        if let Some(dir_attributes) = &res.dir_attributes {
            dir.update_stat(FileStat::from(dir_attributes), self.cfg.actimeo);
        }

        let dc = self.dircache_of(&dir);
        dc.set_verifier(res.verifier);

        let mut served = Vec::with_capacity(res.entries.len());
        for entry in &res.entries {
            served.push(self.absorb_plus_entry(dc, entry));
        }

        if res.eof {
            let last = res.entries.last().map_or(cookie, |e| e.cookie);
            dc.set_eof(last);
        }

        sink.dir_plus(self.pack_readdirplus(&served, size));
    }

    /// Fold one READDIRPLUS entry into the directory cache and return the
    /// servable form.
    fn absorb_plus_entry(&self, dc: &DirCache, entry: &ReaddirplusEntry) -> DirEntry {
        let name = OsString::from_vec(entry.name.clone());
        dc.remove_cookie(entry.cookie, &self.inodes);
        match (&entry.handle, &entry.attributes) {
            (Some(handle), Some(attributes)) => {
                let stat = FileStat::from(attributes);
                let inode = self.inodes.get_or_create(handle, stat);
                dc.add_plus(name.clone(), entry.cookie, &inode, &self.inodes);
                DirEntry {
                    name,
                    cookie: entry.cookie,
                    stat,
                    has_stat: true,
                    inode: Some(inode),
                }
            }
            _ => {
                dc.add_stub(name.clone(), entry.cookie, entry.fileid, &self.inodes);
                DirEntry {
                    name,
                    cookie: entry.cookie,
                    stat: FileStat::stub(entry.fileid),
                    has_stat: false,
                    inode: None,
                }
            }
        }
    }

    /// Pack entries into a readdir reply within the kernel's byte budget.
    fn pack_readdir(&self, entries: &[DirEntry], size: u32) -> ReaddirOut {
        let mut out = ReaddirOut::default();
        let mut used = 0usize;
        for entry in entries {
            let need = align8(DIRENT_HEADER + entry.name.len());
            if used + need > size as usize {
                break;
            }
            used += need;
            out.entries.push(DirEntryOut {
                ino: entry.stat.fileid,
                cookie: entry.cookie,
                kind: entry.stat.kind,
                name: entry.name.clone(),
                entry: None,
            });
        }
        out
    }

    /// Pack entries into a readdirplus reply. Each included entry with an
    /// inode takes one lookup reference which the kernel later FORGETs.
    fn pack_readdirplus(&self, entries: &[DirEntry], size: u32) -> ReaddirOut {
        let mut out = ReaddirOut::default();
        let mut used = 0usize;
        for entry in entries {
            let need = align8(DIRENTPLUS_HEADER + entry.name.len());
            if used + need > size as usize {
                break;
            }
            used += need;
            let plus = entry.inode.as_ref().map(|inode| {
                self.inodes.incref(inode);
                self.entry_out(inode.fuse_ino(), inode.stat())
            });
            out.entries.push(DirEntryOut {
                ino: entry.stat.fileid,
                cookie: entry.cookie,
                kind: entry.stat.kind,
                name: entry.name.clone(),
                entry: plus,
            });
        }
        out
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}
