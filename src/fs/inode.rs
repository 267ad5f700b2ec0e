//! Inode records and the process-wide inode table.
//!
//! An inode is pinned by two independent reference counts: `lookupcnt`
//! (references the kernel bridge holds, dropped by FORGET) and
//! `dircachecnt` (references held by directory-cache entries). The table
//! entry is removed only when both reach zero; either owner alone keeps
//! the inode alive. The map lock is held only for map mutations; count
//! updates are plain atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::rpc::proto::Fh3;

use super::attr::{FileKind, FileStat};
use super::dircache::DirCache;
use super::readahead::RaState;

/// The upstream inode number of the export root.
pub const ROOT_INO: u64 = 1;

struct CachedStat {
    stat: FileStat,
    /// Attributes are authoritative until this deadline.
    valid_until: Option<Instant>,
}

/// One live server object.
pub struct NfsInode {
    fh: Fh3,
    fuse_ino: u64,
    kind: FileKind,
    attr: RwLock<CachedStat>,
    /// References held by the kernel bridge; FORGET drops them.
    pub(crate) lookupcnt: AtomicU64,
    /// References held by directory-cache entries.
    pub(crate) dircachecnt: AtomicU64,
    /// Forgets the kernel still owes us, for diagnostics.
    pub(crate) forget_expected: AtomicU64,
    dircache: OnceLock<DirCache>,
    readahead: OnceLock<RaState>,
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
impl NfsInode {
    fn new(fh: Fh3, fuse_ino: u64, stat: FileStat, valid_until: Option<Instant>) -> Self {
        Self {
            fh,
            fuse_ino,
            kind: stat.kind,
            attr: RwLock::new(CachedStat { stat, valid_until }),
            lookupcnt: AtomicU64::new(0),
            dircachecnt: AtomicU64::new(0),
            forget_expected: AtomicU64::new(0),
            dircache: OnceLock::new(),
            readahead: OnceLock::new(),
        }
    }

    pub fn fuse_ino(&self) -> u64 {
        self.fuse_ino
    }

    pub fn fh(&self) -> &Fh3 {
        &self.fh
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Latest attributes, stale or not. Directory listings and replies
    /// use this; revalidation policy is the caller's business.
    pub fn stat(&self) -> FileStat {
        self.attr.read().expect("poisoned").stat
    }

    /// Attributes if they are still within their validity window.
    pub fn stat_if_fresh(&self) -> Option<FileStat> {
        let cached = self.attr.read().expect("poisoned");
        match cached.valid_until {
            Some(deadline) if Instant::now() < deadline => Some(cached.stat),
            _ => None,
        }
    }

    /// Install fresh attributes valid for `actimeo`.
    pub fn update_stat(&self, stat: FileStat, actimeo: Duration) {
        let mut cached = self.attr.write().expect("poisoned");
        cached.stat = stat;
        cached.valid_until = Some(Instant::now() + actimeo);
    }

    /// The directory cache for this inode, created on first use.
    pub fn dircache(&self, actimeo: Duration, max_bytes: u64) -> &DirCache {
        self.dircache
            .get_or_init(|| DirCache::new(self.fuse_ino, actimeo, max_bytes))
    }

    /// The directory cache if one has been created.
    pub fn dircache_opt(&self) -> Option<&DirCache> {
        self.dircache.get()
    }

    /// Readahead state for this inode, created on the first read.
    pub fn readahead(&self, ra_kib: u64) -> &RaState {
        self.readahead
            .get_or_init(|| RaState::new(self.fuse_ino, ra_kib))
    }

    /// True when the kernel bridge holds no reference.
    pub fn is_forgotten(&self) -> bool {
        self.lookupcnt.load(Ordering::Acquire) == 0
    }

    pub fn lookupcnt(&self) -> u64 {
        self.lookupcnt.load(Ordering::Acquire)
    }

    pub fn dircachecnt(&self) -> u64 {
        self.dircachecnt.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for NfsInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsInode")
            .field("fuse_ino", &self.fuse_ino)
            .field("kind", &self.kind)
            .field("lookupcnt", &self.lookupcnt.load(Ordering::Relaxed))
            .field("dircachecnt", &self.dircachecnt.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct Maps {
    by_fh: HashMap<Fh3, Arc<NfsInode>>,
    by_ino: HashMap<u64, Arc<NfsInode>>,
}

/// Process-wide map from server file handle to inode record.
pub struct InodeTable {
    maps: Mutex<Maps>,
    next_ino: AtomicU64,
    actimeo: Duration,
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
impl InodeTable {
    /// Create the table with the export root preinstalled at inode 1.
    pub fn new(root_fh: Fh3, actimeo: Duration) -> Self {
        let mut root_stat = FileStat::stub(ROOT_INO);
        root_stat.kind = FileKind::Directory;
        root_stat.mode = 0o755;
        root_stat.nlink = 2;
        // No validity window: the first GETATTR refreshes the root.
        let root = Arc::new(NfsInode::new(root_fh.clone(), ROOT_INO, root_stat, None));
        root.lookupcnt.store(1, Ordering::Release);

        let mut by_fh = HashMap::new();
        by_fh.insert(root_fh, Arc::clone(&root));
        let mut by_ino = HashMap::new();
        by_ino.insert(ROOT_INO, root);

        Self {
            maps: Mutex::new(Maps { by_fh, by_ino }),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            actimeo,
        }
    }

    /// Attribute validity window used for records created here.
    pub fn actimeo(&self) -> Duration {
        self.actimeo
    }

    /// Look up a live inode by its upstream number.
    pub fn get(&self, ino: u64) -> Option<Arc<NfsInode>> {
        self.maps.lock().expect("poisoned").by_ino.get(&ino).cloned()
    }

    /// Return the record for `fh`, creating one with fresh attributes and
    /// both counts at zero if this handle is new. Existing records get
    /// their attributes refreshed.
    pub fn get_or_create(&self, fh: &Fh3, stat: FileStat) -> Arc<NfsInode> {
        let mut maps = self.maps.lock().expect("poisoned");
        if let Some(existing) = maps.by_fh.get(fh) {
            let existing = Arc::clone(existing);
            drop(maps);
            existing.update_stat(stat, self.actimeo);
            return existing;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let inode = Arc::new(NfsInode::new(
            fh.clone(),
            ino,
            stat,
            Some(Instant::now() + self.actimeo),
        ));
        maps.by_fh.insert(fh.clone(), Arc::clone(&inode));
        maps.by_ino.insert(ino, Arc::clone(&inode));
        trace!(ino, "created inode");
        inode
    }

    /// Take a kernel-bridge reference.
    pub fn incref(&self, inode: &NfsInode) {
        let prev = inode.lookupcnt.fetch_add(1, Ordering::AcqRel);
        inode.forget_expected.fetch_add(1, Ordering::Relaxed);
        trace!(ino = inode.fuse_ino, lookupcnt = prev + 1, "incref");
    }

    /// Drop a kernel-bridge reference; removes the record when both
    /// counts are exhausted.
    pub fn decref(&self, inode: &Arc<NfsInode>) {
        self.decref_n(inode, 1);
    }

    fn decref_n(&self, inode: &Arc<NfsInode>, n: u64) {
        let prev = inode.lookupcnt.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "lookupcnt underflow on inode {}", inode.fuse_ino);
        trace!(ino = inode.fuse_ino, lookupcnt = prev - n, "decref");
        if prev == n && inode.dircachecnt.load(Ordering::Acquire) == 0 {
            // Purge a dying directory's cache first so its children drop
            // their dircachecnt pins. Runs outside the map lock; the
            // child decrefs recurse through this same path.
            if inode.fuse_ino != ROOT_INO {
                if let Some(dc) = inode.dircache_opt() {
                    dc.clear(self);
                }
            }
            self.try_remove(inode);
        }
    }

    /// Remove the record if both counts are zero. Re-checked under the
    /// map lock: a racing lookup may have resurrected the inode through a
    /// directory-cache reference.
    fn try_remove(&self, inode: &Arc<NfsInode>) {
        if inode.fuse_ino == ROOT_INO {
            return;
        }
        let mut maps = self.maps.lock().expect("poisoned");
        if inode.lookupcnt.load(Ordering::Acquire) != 0
            || inode.dircachecnt.load(Ordering::Acquire) != 0
        {
            return;
        }
        maps.by_fh.remove(&inode.fh);
        maps.by_ino.remove(&inode.fuse_ino);
        trace!(ino = inode.fuse_ino, "destroyed inode");
    }

    /// Drop a directory-cache reference. Freeing is funnelled through the
    /// decref path: take a fresh lookup reference, release the cache
    /// reference, then decref, so removal cannot race a concurrent
    /// lookup resurrecting the inode through the cache.
    pub fn drop_dircache_ref(&self, inode: &Arc<NfsInode>) {
        inode.lookupcnt.fetch_add(1, Ordering::AcqRel);
        let prev = inode.dircachecnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "dircachecnt underflow on inode {}", inode.fuse_ino);
        self.decref_n(inode, 1);
    }

    /// Upstream FORGET: drop `n` kernel-bridge references at once.
    pub fn forget(&self, ino: u64, n: u64) {
        let Some(inode) = self.get(ino) else {
            warn!(ino, "forget on unknown inode");
            return;
        };
        let owed = inode.forget_expected.load(Ordering::Relaxed);
        if owed < n {
            warn!(ino, owed, n, "forget exceeds expected count");
        }
        inode.forget_expected.store(owed.saturating_sub(n), Ordering::Relaxed);
        self.decref_n(&inode, n);
    }

    /// Number of live inodes (including the root).
    pub fn len(&self) -> usize {
        self.maps.lock().expect("poisoned").by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
