#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

//! Directory-cache invariants: the two views stay synchronized, the
//! contiguity counter and confirmed state behave, and the dual-refcount
//! discipline frees inodes exactly when both owners are gone.

mod common;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use common::{fh, root_fh};
use nfs_fs::fs::attr::FileStat;
use nfs_fs::fs::dircache::{DirCache, SYNTHETIC_COOKIE_BASE};
use nfs_fs::fs::inode::{InodeTable, NfsInode};

fn table() -> InodeTable {
    InodeTable::new(root_fh(), Duration::from_secs(60))
}

fn cache() -> DirCache {
    DirCache::new(1, Duration::from_secs(60), 1024 * 1024)
}

fn inode(table: &InodeTable, tag: u8, fileid: u64) -> Arc<NfsInode> {
    table.get_or_create(&fh(tag), FileStat::stub(fileid))
}

#[test]
fn add_lookup_remove_round_trip() {
    let t = table();
    let dc = cache();

    assert!(dc.add_stub("a".into(), 1, 100, &t));
    let entry = dc.lookup_cookie(1).expect("cached entry");
    assert_eq!(entry.name, OsStr::new("a"));
    assert_eq!(entry.stat.fileid, 100);
    assert_eq!(dc.seq_last_cookie(), 1);

    assert!(dc.remove_cookie(1, &t));
    assert!(dc.lookup_cookie(1).is_none());
    assert_eq!(dc.len(), 0);
    assert_eq!(dc.seq_last_cookie(), 0, "removing the run's tail regresses it");
    assert_eq!(dc.cache_size(), 0);
}

#[test]
fn both_views_stay_the_same_size() {
    let t = table();
    let dc = cache();

    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        dc.add_stub((*name).into(), i as u64 + 1, 100 + i as u64, &t);
        let (cookies, names) = dc.view_sizes();
        assert_eq!(cookies, names);
    }
    dc.remove_name(OsStr::new("b"), &t);
    let (cookies, names) = dc.view_sizes();
    assert_eq!(cookies, names);
    assert_eq!(cookies, 3);
}

#[test]
fn seq_last_cookie_tracks_the_contiguous_run() {
    let t = table();
    let dc = cache();

    dc.add_stub("a".into(), 1, 100, &t);
    dc.add_stub("b".into(), 2, 101, &t);
    assert_eq!(dc.seq_last_cookie(), 2);

    // A gap: cookie 4 does not extend the run.
    dc.add_stub("d".into(), 4, 103, &t);
    assert_eq!(dc.seq_last_cookie(), 2);

    dc.add_stub("c".into(), 3, 102, &t);
    assert_eq!(dc.seq_last_cookie(), 3);
}

#[test]
fn removing_inside_the_run_truncates_it() {
    let t = table();
    let dc = cache();
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        dc.add_stub((*name).into(), i as u64 + 1, 100 + i as u64, &t);
    }
    assert_eq!(dc.seq_last_cookie(), 3);
    dc.remove_cookie(2, &t);
    assert_eq!(dc.seq_last_cookie(), 1);
}

#[test]
fn eof_confirms_only_a_gapless_scan() {
    let t = table();
    let dc = cache();
    dc.add_stub("a".into(), 1, 100, &t);
    dc.add_stub("b".into(), 2, 101, &t);
    dc.set_eof(2);
    assert!(dc.is_confirmed(), "full scan, cache confirmed");

    let dc2 = cache();
    dc2.add_stub("a".into(), 1, 100, &t);
    dc2.add_stub("c".into(), 3, 102, &t);
    dc2.set_eof(3);
    assert!(!dc2.is_confirmed(), "scan with a gap is never confirmed");
}

#[test]
fn confirmed_state_expires_with_actimeo() {
    let t = table();
    let dc = DirCache::new(1, Duration::ZERO, 1024 * 1024);
    dc.add_stub("a".into(), 1, 100, &t);
    dc.set_eof(1);
    assert!(!dc.is_confirmed(), "zero actimeo expires immediately");
}

#[test]
fn dnlc_add_promotes_a_stub_in_place() {
    let t = table();
    let dc = cache();
    dc.add_stub("a".into(), 1, 100, &t);

    let node = inode(&t, 1, 100);
    dc.dnlc_add(OsStr::new("a"), &node, &t);

    assert_eq!(dc.len(), 1, "promotion reuses the entry");
    let entry = dc.lookup_cookie(1).expect("still under the server cookie");
    assert!(entry.inode.is_some());
    assert_eq!(node.dircachecnt(), 1);

    // Promoting again with the same inode is a no-op.
    dc.dnlc_add(OsStr::new("a"), &node, &t);
    assert_eq!(node.dircachecnt(), 1);
}

#[test]
fn dnlc_add_without_prior_entry_uses_synthetic_cookies() {
    let t = table();
    let dc = cache();
    let node = inode(&t, 1, 100);
    dc.dnlc_add(OsStr::new("a"), &node, &t);

    assert!(dc.lookup_cookie(SYNTHETIC_COOKIE_BASE).is_some());
    assert_eq!(
        dc.seq_last_cookie(),
        0,
        "synthetic cookies never join the enumeration run"
    );
}

#[test]
fn dnlc_add_replaces_a_stale_entry() {
    let t = table();
    let dc = cache();
    let old = inode(&t, 1, 100);
    let new = inode(&t, 2, 200);

    dc.dnlc_add(OsStr::new("a"), &old, &t);
    assert_eq!(old.dircachecnt(), 1);

    dc.dnlc_add(OsStr::new("a"), &new, &t);
    assert_eq!(old.dircachecnt(), 0, "stale entry released its reference");
    assert_eq!(new.dircachecnt(), 1);
    assert_eq!(dc.len(), 1);
}

#[test]
fn removing_the_last_reference_destroys_the_inode() {
    let t = table();
    let dc = cache();
    let node = inode(&t, 1, 100);
    let ino = node.fuse_ino();
    dc.dnlc_add(OsStr::new("a"), &node, &t);
    drop(node);

    assert_eq!(t.len(), 2, "root plus the cached inode");
    assert!(dc.remove_name(OsStr::new("a"), &t));
    assert!(
        t.get(ino).is_none(),
        "no lookup references and no cache references: destroyed"
    );
    assert_eq!(t.len(), 1);
}

#[test]
fn kernel_reference_outlives_cache_removal() {
    let t = table();
    let dc = cache();
    let node = inode(&t, 1, 100);
    let ino = node.fuse_ino();
    t.incref(&node);
    dc.dnlc_add(OsStr::new("a"), &node, &t);

    dc.remove_name(OsStr::new("a"), &t);
    assert!(t.get(ino).is_some(), "lookupcnt still pins the inode");
    assert_eq!(node.dircachecnt(), 0);

    t.forget(ino, 1);
    assert!(t.get(ino).is_none());
}

#[test]
fn size_cap_refuses_entries_and_clears_confirmed() {
    let t = table();
    let dc = DirCache::new(1, Duration::from_secs(60), 1);

    assert!(dc.add_stub("a".into(), 1, 100, &t), "first entry fits under the cap");
    dc.set_eof(1);
    assert!(dc.is_confirmed());

    assert!(!dc.add_stub("b".into(), 2, 101, &t), "cap refuses the entry");
    assert_eq!(dc.len(), 1);
    assert!(
        !dc.is_confirmed(),
        "a truncated cache may not answer negative lookups"
    );
}

#[test]
fn clear_resets_enumeration_state_and_releases_inodes() {
    let t = table();
    let dc = cache();
    let node = inode(&t, 1, 100);
    let ino = node.fuse_ino();
    dc.dnlc_add(OsStr::new("a"), &node, &t);
    dc.add_stub("b".into(), 1, 101, &t);
    dc.set_verifier(*b"12345678");
    dc.set_eof(1);
    drop(node);

    dc.clear(&t);
    assert_eq!(dc.len(), 0);
    assert_eq!(dc.seq_last_cookie(), 0);
    assert_eq!(dc.cache_size(), 0);
    assert_eq!(dc.verifier(), [0; 8]);
    assert!(!dc.is_confirmed());
    assert!(t.get(ino).is_none(), "cache was the last owner");
}

#[test]
fn rename_collision_on_add_evicts_the_older_cookie() {
    let t = table();
    let dc = cache();
    dc.add_stub("a".into(), 1, 100, &t);
    // The same name reappears under a newer cookie (renamed back and
    // forth server-side between scans).
    dc.add_stub("a".into(), 5, 100, &t);

    assert_eq!(dc.len(), 1);
    assert!(dc.lookup_cookie(1).is_none(), "older sighting evicted");
    assert!(dc.lookup_cookie(5).is_some());
    let (cookies, names) = dc.view_sizes();
    assert_eq!(cookies, names);
}
