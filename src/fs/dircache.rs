//! Per-directory readdir cache with a name index (DNLC).
//!
//! Two synchronized views over one set of entries: `by_cookie` orders
//! entries the way the server enumerates them, `by_name` answers LOOKUP
//! without a round-trip. Every entry that references an inode holds one
//! unit of that inode's `dircachecnt`; releasing the last unit routes
//! through the inode table's decref path (grab a lookup reference, drop
//! the cache reference, decref) so freeing cannot race a concurrent
//! lookup resurrecting the inode through this cache.
//!
//! A directory is *confirmed* when a scan has covered every cookie from 1
//! through the server's EOF cookie with nothing evicted in between; while
//! confirmed (for `actimeo`), a missing name is authoritatively absent
//! and negative lookups need no RPC.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::attr::FileStat;
use super::inode::{InodeTable, NfsInode};

/// Entries created by name-only insertion draw cookies from here; real
/// server cookies never reach this range.
pub const SYNTHETIC_COOKIE_BASE: u64 = 1 << 63;

/// One cached directory entry.
///
/// Entries come in three flavors: full entries carrying an inode
/// reference (READDIRPLUS, lookup/create promotion), attribute stubs
/// knowing only the fileid (plain READDIR), and everything in between
/// after an in-place promotion.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub cookie: u64,
    pub stat: FileStat,
    pub has_stat: bool,
    pub inode: Option<Arc<NfsInode>>,
}

impl DirEntry {
    /// Full entry referencing a live inode. Takes one `dircachecnt` unit,
    /// held for as long as the entry sits in a cache.
    fn with_inode(name: OsString, cookie: u64, inode: &Arc<NfsInode>) -> Self {
        inode.dircachecnt.fetch_add(1, Ordering::AcqRel);
        Self {
            name,
            cookie,
            stat: inode.stat(),
            has_stat: true,
            inode: Some(Arc::clone(inode)),
        }
    }

    /// Attribute-less stub from a plain READDIR response.
    fn stub(name: OsString, cookie: u64, fileid: u64) -> Self {
        Self {
            name,
            cookie,
            stat: FileStat::stub(fileid),
            has_stat: false,
            inode: None,
        }
    }

    fn byte_size(&self) -> u64 {
        (std::mem::size_of::<Self>() + self.name.len()) as u64
    }
}

/// Drop one cache reference from `inode`. When it is the last one, a
/// guard lookup reference is taken *first* and the inode queued for a
/// post-lock decref, so the counts never read zero/zero while the record
/// is still mapped.
fn release_cache_ref(inode: &Arc<NfsInode>, release: &mut Vec<Arc<NfsInode>>) {
    if inode.dircachecnt.load(Ordering::Acquire) == 1 {
        inode.lookupcnt.fetch_add(1, Ordering::AcqRel);
        release.push(Arc::clone(inode));
    }
    inode.dircachecnt.fetch_sub(1, Ordering::AcqRel);
}

/// Outcome of a DNLC probe.
pub enum DnlcLookup {
    /// Name resolves to a live inode; one lookup reference has been taken
    /// on the caller's behalf.
    Positive(Arc<NfsInode>),
    /// The name exists (seen in a READDIR scan) but the cache has no
    /// handle for it; a real LOOKUP is required.
    NameOnly,
    /// Nothing cached under this name. `negative_confirmed` is true when
    /// the cache can authoritatively assert the name does not exist.
    Miss {
        negative_confirmed: bool,
    },
}

struct Inner {
    by_cookie: BTreeMap<u64, DirEntry>,
    by_name: HashMap<OsString, u64>,
    eof: bool,
    eof_cookie: u64,
    /// Greatest cookie C such that every cookie in [1, C] is cached.
    seq_last_cookie: u64,
    /// Set when the cache was last proven complete.
    confirmed_at: Option<Instant>,
    cookie_verifier: [u8; 8],
    cache_size: u64,
}

impl Inner {
    /// Detach `cookie` from both views. If the entry pins an inode whose
    /// last cache reference this is, a guard lookup reference is taken and
    /// the inode queued on `release` for the post-lock decref.
    fn detach(&mut self, cookie: u64, release: &mut Vec<Arc<NfsInode>>) -> Option<DirEntry> {
        let entry = self.by_cookie.remove(&cookie)?;
        self.by_name.remove(&entry.name);
        self.cache_size = self.cache_size.saturating_sub(entry.byte_size());
        if cookie != 0 && cookie <= self.seq_last_cookie {
            // The contiguous run now ends just short of the removed slot.
            self.seq_last_cookie = cookie - 1;
        }
        if let Some(inode) = &entry.inode {
            release_cache_ref(inode, release);
        }
        Some(entry)
    }

    /// Insert an already-constructed entry, evicting whatever its name or
    /// cookie collides with. Returns false (and undoes the entry's inode
    /// reference via `release`) when the size cap refuses it.
    fn attach(
        &mut self,
        entry: DirEntry,
        max_bytes: u64,
        dir_ino: u64,
        release: &mut Vec<Arc<NfsInode>>,
    ) -> bool {
        if self.cache_size >= max_bytes {
            warn!(
                dir = dir_ino,
                size = self.cache_size,
                "directory cache at size cap, refusing entry"
            );
            // A truncated cache may no longer answer negative lookups.
            self.confirmed_at = None;
            if let Some(inode) = &entry.inode {
                release_cache_ref(inode, release);
            }
            return false;
        }

        // A rename or recreate can leave the same name under an older
        // cookie; the newer sighting wins.
        if let Some(&old) = self.by_name.get(&entry.name) {
            if old != entry.cookie {
                self.detach(old, release);
            }
        }
        self.detach(entry.cookie, release);

        trace!(dir = dir_ino, cookie = entry.cookie, name = ?entry.name, "dir cache add");
        self.cache_size += entry.byte_size();
        self.by_name.insert(entry.name.clone(), entry.cookie);
        if entry.cookie == self.seq_last_cookie + 1 {
            self.seq_last_cookie = entry.cookie;
        }
        self.by_cookie.insert(entry.cookie, entry);

        debug_assert_eq!(self.by_cookie.len(), self.by_name.len());
        true
    }
}

/// Directory cache for one directory inode.
pub struct DirCache {
    dir_ino: u64,
    actimeo: Duration,
    max_bytes: u64,
    next_synthetic: AtomicU64,
    inner: RwLock<Inner>,
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
impl DirCache {
    pub fn new(dir_ino: u64, actimeo: Duration, max_bytes: u64) -> Self {
        Self {
            dir_ino,
            actimeo,
            max_bytes,
            next_synthetic: AtomicU64::new(SYNTHETIC_COOKIE_BASE),
            inner: RwLock::new(Inner {
                by_cookie: BTreeMap::new(),
                by_name: HashMap::new(),
                eof: false,
                eof_cookie: 0,
                seq_last_cookie: 0,
                confirmed_at: None,
                cookie_verifier: [0; 8],
                cache_size: 0,
            }),
        }
    }

    /// Insert a full entry from a READDIRPLUS result.
    pub fn add_plus(
        &self,
        name: OsString,
        cookie: u64,
        inode: &Arc<NfsInode>,
        table: &InodeTable,
    ) -> bool {
        debug_assert_ne!(cookie, 0, "0 is not a valid cookie");
        let mut release = Vec::new();
        let added = {
            let mut inner = self.inner.write().expect("poisoned");
            let entry = DirEntry::with_inode(name, cookie, inode);
            inner.attach(entry, self.max_bytes, self.dir_ino, &mut release)
        };
        self.release_after_unlock(release, table);
        added
    }

    /// Insert a fileid-only stub from a plain READDIR result.
    pub fn add_stub(&self, name: OsString, cookie: u64, fileid: u64, table: &InodeTable) -> bool {
        debug_assert_ne!(cookie, 0, "0 is not a valid cookie");
        let mut release = Vec::new();
        let added = {
            let mut inner = self.inner.write().expect("poisoned");
            let entry = DirEntry::stub(name, cookie, fileid);
            inner.attach(entry, self.max_bytes, self.dir_ino, &mut release)
        };
        self.release_after_unlock(release, table);
        added
    }

    /// Promote a successful lookup/create into this cache without a
    /// server-issued cookie.
    ///
    /// A matching entry is left alone; a stub for the same name gains the
    /// inode in place; a stale entry (same name, different inode) is
    /// replaced under a fresh synthetic cookie, as is a missing one.
    pub fn dnlc_add(&self, name: &OsStr, inode: &Arc<NfsInode>, table: &InodeTable) {
        let mut release = Vec::new();
        {
            let mut inner = self.inner.write().expect("poisoned");

            if let Some(&cookie) = inner.by_name.get(name) {
                let entry = inner
                    .by_cookie
                    .get_mut(&cookie)
                    .unwrap_or_else(|| unreachable!("by_name points at a cached cookie"));
                match &entry.inode {
                    Some(existing) if Arc::ptr_eq(existing, inode) => return,
                    None => {
                        inode.dircachecnt.fetch_add(1, Ordering::AcqRel);
                        entry.inode = Some(Arc::clone(inode));
                        entry.stat = inode.stat();
                        entry.has_stat = true;
                        return;
                    }
                    Some(_) => {
                        debug!(dir = self.dir_ino, ?name, "replacing stale dnlc entry");
                        inner.detach(cookie, &mut release);
                    }
                }
            }

            let cookie = self.next_synthetic.fetch_add(1, Ordering::Relaxed);
            let entry = DirEntry::with_inode(name.to_owned(), cookie, inode);
            inner.attach(entry, self.max_bytes, self.dir_ino, &mut release);
        }
        self.release_after_unlock(release, table);
    }

    /// Entry for `cookie`, if cached. Returns a snapshot; the inode
    /// reference inside it keeps the record alive on its own.
    pub fn lookup_cookie(&self, cookie: u64) -> Option<DirEntry> {
        self.inner
            .read()
            .expect("poisoned")
            .by_cookie
            .get(&cookie)
            .cloned()
    }

    /// DNLC probe for `name`. A positive hit takes a lookup reference on
    /// the caller's behalf (the cache reference stays with the entry).
    pub fn dnlc_lookup(&self, name: &OsStr) -> DnlcLookup {
        let inner = self.inner.read().expect("poisoned");
        match inner.by_name.get(name).and_then(|c| inner.by_cookie.get(c)) {
            Some(entry) => match &entry.inode {
                Some(inode) => {
                    // Convert the entry's cache reference into a fresh
                    // lookup reference for the caller; the entry keeps its
                    // own. Whether this reference reaches the kernel (and
                    // thus owes a forget) is the caller's call.
                    inode.lookupcnt.fetch_add(1, Ordering::AcqRel);
                    DnlcLookup::Positive(Arc::clone(inode))
                }
                None => DnlcLookup::NameOnly,
            },
            None => DnlcLookup::Miss {
                negative_confirmed: self.is_confirmed_inner(&inner),
            },
        }
    }

    /// Remove by cookie. Returns false when nothing was cached.
    pub fn remove_cookie(&self, cookie: u64, table: &InodeTable) -> bool {
        let mut release = Vec::new();
        let removed = self
            .inner
            .write()
            .expect("poisoned")
            .detach(cookie, &mut release)
            .is_some();
        self.release_after_unlock(release, table);
        removed
    }

    /// Remove by name. Returns false when nothing was cached.
    pub fn remove_name(&self, name: &OsStr, table: &InodeTable) -> bool {
        let mut release = Vec::new();
        let removed = {
            let mut inner = self.inner.write().expect("poisoned");
            match inner.by_name.get(name).copied() {
                Some(cookie) => inner.detach(cookie, &mut release).is_some(),
                None => false,
            }
        };
        self.release_after_unlock(release, table);
        removed
    }

    /// Drop every entry and reset enumeration state.
    pub fn clear(&self, table: &InodeTable) {
        let mut release = Vec::new();
        {
            let mut inner = self.inner.write().expect("poisoned");
            let cookies: Vec<u64> = inner.by_cookie.keys().copied().collect();
            for cookie in cookies {
                inner.detach(cookie, &mut release);
            }
            debug_assert!(inner.by_name.is_empty());
            inner.eof = false;
            inner.eof_cookie = 0;
            inner.seq_last_cookie = 0;
            inner.confirmed_at = None;
            inner.cookie_verifier = [0; 8];
            inner.cache_size = 0;
        }
        if !release.is_empty() {
            debug!(
                dir = self.dir_ino,
                count = release.len(),
                "inodes to be freed after dir cache purge"
            );
        }
        self.release_after_unlock(release, table);
    }

    /// Record the server's end-of-directory. Marks the cache confirmed iff
    /// every cookie up to `eof_cookie` was seen contiguously.
    pub fn set_eof(&self, eof_cookie: u64) {
        let mut inner = self.inner.write().expect("poisoned");
        inner.eof = true;
        inner.eof_cookie = eof_cookie;
        if inner.seq_last_cookie == eof_cookie {
            inner.confirmed_at = Some(Instant::now());
            debug!(
                dir = self.dir_ino,
                eof_cookie, "directory scan complete, cache confirmed"
            );
        } else {
            inner.confirmed_at = None;
            debug!(
                dir = self.dir_ino,
                seq_last_cookie = inner.seq_last_cookie,
                eof_cookie,
                "directory scan complete but cache has gaps, not confirmed"
            );
        }
    }

    fn is_confirmed_inner(&self, inner: &Inner) -> bool {
        inner
            .confirmed_at
            .is_some_and(|at| at.elapsed() < self.actimeo)
    }

    /// Whether negative lookups may currently be answered from the cache.
    pub fn is_confirmed(&self) -> bool {
        let inner = self.inner.read().expect("poisoned");
        self.is_confirmed_inner(&inner)
    }

    /// Cookie verifier to echo on the next enumeration call.
    pub fn verifier(&self) -> [u8; 8] {
        self.inner.read().expect("poisoned").cookie_verifier
    }

    pub fn set_verifier(&self, v: [u8; 8]) {
        self.inner.write().expect("poisoned").cookie_verifier = v;
    }

    /// Serve an enumeration slice from cache: up to `max_entries` entries
    /// with contiguous cookies following `after_cookie`. Returns `None`
    /// when the cache cannot cover the request (gap before `max_entries`
    /// entries and before EOF), meaning the caller must go to the server.
    /// The bool is true when the slice ends the directory.
    pub fn serve(&self, after_cookie: u64, max_entries: usize) -> Option<(Vec<DirEntry>, bool)> {
        let inner = self.inner.read().expect("poisoned");

        if inner.eof && after_cookie >= inner.eof_cookie && inner.eof_cookie != 0 {
            return Some((Vec::new(), true));
        }

        let mut out = Vec::new();
        let mut expected = after_cookie + 1;
        for (&cookie, entry) in inner.by_cookie.range(expected..) {
            if cookie != expected || out.len() >= max_entries {
                break;
            }
            out.push(entry.clone());
            expected += 1;
        }

        let at_eof = inner.eof && expected > inner.eof_cookie;
        if at_eof || out.len() >= max_entries {
            Some((out, at_eof))
        } else {
            None
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("poisoned");
        debug_assert_eq!(inner.by_cookie.len(), inner.by_name.len());
        inner.by_cookie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte estimate of the cached entries.
    pub fn cache_size(&self) -> u64 {
        self.inner.read().expect("poisoned").cache_size
    }

    /// Greatest cookie C with [1, C] cached contiguously.
    pub fn seq_last_cookie(&self) -> u64 {
        self.inner.read().expect("poisoned").seq_last_cookie
    }

    /// Both views stay the same size; exposed for sanity checks.
    pub fn view_sizes(&self) -> (usize, usize) {
        let inner = self.inner.read().expect("poisoned");
        (inner.by_cookie.len(), inner.by_name.len())
    }

    /// Release guard references taken by `detach`, outside the cache
    /// lock. Lock order is inode table before directory cache, so the
    /// decref (which may take the table lock) must not run under ours.
    fn release_after_unlock(&self, release: Vec<Arc<NfsInode>>, table: &InodeTable) {
        for inode in release {
            table.decref(&inode);
        }
    }
}
