#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

//! End-to-end scenarios against a scripted transport: cache fast paths,
//! retry behavior, reference counting, and readahead scheduling.

mod common;

use std::ffi::OsStr;

use common::{fattr, fh, one_reply, sink, test_client, test_config, MockTransport, ReplyEvent};
use nfs_fs::fs::client::LookupCachePolicy;
use nfs_fs::fs::task::MAX_OUTSTANDING_RPC_TASKS;
use nfs_fs::fs::ROOT_INO;
use nfs_fs::rpc::proto::{
    CreateRes, Fattr3, Fh3, FsstatRes, Ftype3, LookupRes, NfsStat3, ProcCall, ProcReply,
    ReaddirEntry, ReaddirplusEntry, ReaddirplusRes, ReaddirRes, ReadRes, RemoveRes, SetattrRes,
    WriteRes,
};
use nfs_fs::rpc::transport::RpcStatus;

type Outcome = (RpcStatus, Option<ProcReply>);

fn ok_lookup(handle: Fh3, attrs: Fattr3) -> Outcome {
    (
        RpcStatus::Success,
        Some(ProcReply::Lookup(
            NfsStat3::Ok,
            Some(LookupRes {
                object: handle,
                attributes: Some(attrs),
                dir_attributes: None,
            }),
        )),
    )
}

fn nfs_err_lookup(status: NfsStat3) -> Outcome {
    (RpcStatus::Success, Some(ProcReply::Lookup(status, None)))
}

fn ok_getattr(attrs: Fattr3) -> Outcome {
    (
        RpcStatus::Success,
        Some(ProcReply::Getattr(
            NfsStat3::Ok,
            Some(nfs_fs::rpc::proto::GetattrRes { attributes: attrs }),
        )),
    )
}

fn nfs_err_getattr(status: NfsStat3) -> Outcome {
    (RpcStatus::Success, Some(ProcReply::Getattr(status, None)))
}

fn ok_create(plus: bool, handle: Fh3, attrs: Fattr3) -> Outcome {
    let res = CreateRes {
        object: Some(handle),
        attributes: Some(attrs),
    };
    let reply = if plus {
        ProcReply::Create(NfsStat3::Ok, Some(res))
    } else {
        ProcReply::Mkdir(NfsStat3::Ok, Some(res))
    };
    (RpcStatus::Success, Some(reply))
}

fn ok_remove() -> Outcome {
    (
        RpcStatus::Success,
        Some(ProcReply::Remove(
            NfsStat3::Ok,
            Some(RemoveRes {
                dir_attributes: None,
            }),
        )),
    )
}

fn ok_readdirplus(entries: Vec<ReaddirplusEntry>, eof: bool) -> Outcome {
    (
        RpcStatus::Success,
        Some(ProcReply::Readdirplus(
            NfsStat3::Ok,
            Some(ReaddirplusRes {
                dir_attributes: None,
                verifier: *b"verifier",
                entries,
                eof,
            }),
        )),
    )
}

fn ok_readdir(entries: Vec<ReaddirEntry>, eof: bool) -> Outcome {
    (
        RpcStatus::Success,
        Some(ProcReply::Readdir(
            NfsStat3::Ok,
            Some(ReaddirRes {
                dir_attributes: None,
                verifier: *b"verifier",
                entries,
                eof,
            }),
        )),
    )
}

fn plus_entry(name: &str, cookie: u64, handle: Fh3, attrs: Fattr3) -> ReaddirplusEntry {
    ReaddirplusEntry {
        fileid: attrs.fileid,
        name: name.as_bytes().to_vec(),
        cookie,
        attributes: Some(attrs),
        handle: Some(handle),
    }
}

#[test]
fn cold_lookup_then_cached_lookup_then_forget() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| ok_lookup(fh(1), fattr(100, Ftype3::Reg, 42))));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("a"), s);
    let ReplyEvent::Entry { ino, fileid } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    assert_ne!(ino, 0);
    assert_ne!(ino, ROOT_INO);
    assert_eq!(fileid, 100);
    assert_eq!(transport.call_count(), 1);

    let inode = client.inodes().get(ino).expect("inode live");
    assert_eq!(inode.lookupcnt(), 1);
    assert_eq!(inode.dircachecnt(), 1, "dnlc holds one cache reference");

    // Within actimeo the second lookup is a DNLC hit: same inode, no RPC.
    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("a"), s);
    let ReplyEvent::Entry { ino: ino2, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    assert_eq!(ino2, ino);
    assert_eq!(transport.call_count(), 1, "served without an RPC");
    assert_eq!(inode.lookupcnt(), 2);

    // Both kernel references dropped: only the dir cache pins it now.
    client.forget(ino, 2);
    assert!(
        client.inodes().get(ino).is_some(),
        "dircachecnt alone keeps the inode alive"
    );
    assert_eq!(client.tasks().free_count(), MAX_OUTSTANDING_RPC_TASKS);
}

#[test]
fn negative_lookup_answered_by_confirmed_directory() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| {
        ok_readdirplus(
            vec![
                plus_entry("a", 1, fh(1), fattr(100, Ftype3::Reg, 1)),
                plus_entry("b", 2, fh(2), fattr(101, Ftype3::Reg, 1)),
            ],
            true,
        )
    }));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.readdirplus(ROOT_INO, 4096, 0, s);
    let ReplyEvent::DirPlus(entries) = one_reply(&rx) else {
        panic!("expected dirplus reply");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(transport.call_count(), 1);

    // Fully-scanned directory: absence of "c" is authoritative.
    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("c"), s);
    let ReplyEvent::Entry { ino, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    assert_eq!(ino, 0, "negative entry carries inode 0");
    assert_eq!(transport.call_count(), 1, "no RPC for the negative lookup");
}

#[test]
fn negative_lookup_needs_rpc_without_negative_caching() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| {
        ok_readdirplus(vec![plus_entry("a", 1, fh(1), fattr(100, Ftype3::Reg, 1))], true)
    }));
    transport.push(Box::new(|_| nfs_err_lookup(NfsStat3::Noent)));

    let mut cfg = test_config();
    cfg.lookup_cache = LookupCachePolicy::Positive;
    let client = test_client(&transport, cfg);

    let (s, rx) = sink();
    client.readdirplus(ROOT_INO, 4096, 0, s);
    one_reply(&rx);

    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("c"), s);
    let ReplyEvent::Error(errno) = one_reply(&rx) else {
        panic!("expected error reply");
    };
    assert_eq!(errno, libc::ENOENT);
    assert_eq!(transport.call_count(), 2, "positive-only mode goes to the server");
}

#[test]
fn dnlc_rename_collision_replaces_entry_and_keeps_old_inode() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| ok_lookup(fh(1), fattr(100, Ftype3::Reg, 1))));
    transport.push(Box::new(|_| {
        // Server-side unlink+recreate: same name, different handle.
        ok_readdirplus(vec![plus_entry("a", 1, fh(2), fattr(200, Ftype3::Reg, 1))], true)
    }));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("a"), s);
    let ReplyEvent::Entry { ino: old_ino, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    let old_inode = client.inodes().get(old_ino).unwrap();
    assert_eq!(old_inode.dircachecnt(), 1);

    let (s, rx) = sink();
    client.readdirplus(ROOT_INO, 4096, 0, s);
    let ReplyEvent::DirPlus(entries) = one_reply(&rx) else {
        panic!("expected dirplus reply");
    };
    let new_ino = entries[0].2;
    assert_ne!(new_ino, old_ino, "recreated file gets a fresh inode");

    // The stale entry lost its cache reference; the kernel still pins it.
    assert_eq!(old_inode.dircachecnt(), 0);
    assert_eq!(old_inode.lookupcnt(), 1);

    // DNLC now resolves "a" to the new inode without an RPC.
    let calls_before = transport.call_count();
    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("a"), s);
    let ReplyEvent::Entry { ino, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    assert_eq!(ino, new_ino);
    assert_eq!(transport.call_count(), calls_before);

    // Upstream finally forgets the old inode and it is destroyed.
    client.forget(old_ino, 1);
    assert!(client.inodes().get(old_ino).is_none());
}

#[test]
fn serverfault_getattr_is_retried_once_then_succeeds() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| nfs_err_getattr(NfsStat3::Serverfault)));
    transport.push(Box::new(|_| ok_getattr(fattr(1, Ftype3::Dir, 0))));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.getattr(ROOT_INO, s);
    let ReplyEvent::Attr { ino } = one_reply(&rx) else {
        panic!("expected attr reply");
    };
    assert_eq!(ino, ROOT_INO);
    assert_eq!(transport.call_count(), 2, "exactly one retry");
}

#[test]
fn transport_errors_exhaust_the_retry_budget() {
    let transport = MockTransport::new();
    for _ in 0..8 {
        transport.push(Box::new(|_| (RpcStatus::Error, None)));
    }
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.getattr(ROOT_INO, s);
    let ReplyEvent::Error(errno) = one_reply(&rx) else {
        panic!("expected error reply");
    };
    assert_eq!(errno, libc::EIO);
    assert_eq!(
        transport.call_count(),
        4,
        "MAX_ERRNO_RETRIES + 1 submissions, then fail"
    );
    assert_eq!(client.tasks().free_count(), MAX_OUTSTANDING_RPC_TASKS);
}

#[test]
fn terminal_nfs_error_is_not_retried_for_nonidempotent_ops() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| {
        (
            RpcStatus::Success,
            Some(ProcReply::Create(NfsStat3::Rofs, None)),
        )
    }));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.create(ROOT_INO, OsStr::new("f"), 0o644, s);
    let ReplyEvent::Error(errno) = one_reply(&rx) else {
        panic!("expected error reply");
    };
    assert_eq!(errno, libc::EROFS);
    assert_eq!(transport.call_count(), 1, "CREATE must not auto-retry NFS errors");
}

#[test]
fn create_promotes_into_dnlc() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| ok_create(true, fh(5), fattr(500, Ftype3::Reg, 0))));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.create(ROOT_INO, OsStr::new("new.txt"), 0o644, s);
    let ReplyEvent::Created { ino } = one_reply(&rx) else {
        panic!("expected create reply");
    };
    assert_ne!(ino, 0);

    // The freshly created name resolves from cache.
    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("new.txt"), s);
    let ReplyEvent::Entry { ino: ino2, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    assert_eq!(ino2, ino);
    assert_eq!(transport.call_count(), 1);
}

#[test]
fn mkdir_replies_entry_and_caches() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| ok_create(false, fh(6), fattr(600, Ftype3::Dir, 0))));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.mkdir(ROOT_INO, OsStr::new("subdir"), 0o755, s);
    let ReplyEvent::Entry { ino, fileid } = one_reply(&rx) else {
        panic!("expected entry reply");
    };
    assert_eq!(fileid, 600);
    let inode = client.inodes().get(ino).unwrap();
    assert_eq!(inode.kind(), nfs_fs::fs::attr::FileKind::Directory);
}

#[test]
fn unlink_drops_the_cached_entry() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| {
        ok_readdirplus(
            vec![
                plus_entry("a", 1, fh(1), fattr(100, Ftype3::Reg, 1)),
                plus_entry("b", 2, fh(2), fattr(101, Ftype3::Reg, 1)),
            ],
            true,
        )
    }));
    transport.push(Box::new(|_| ok_remove()));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.readdirplus(ROOT_INO, 4096, 0, s);
    one_reply(&rx);

    let root = client.inodes().get(ROOT_INO).unwrap();
    let dc = root.dircache_opt().expect("populated by readdirplus");
    assert_eq!(dc.len(), 2);

    let (s, rx) = sink();
    client.unlink(ROOT_INO, OsStr::new("a"), s);
    assert!(matches!(one_reply(&rx), ReplyEvent::Ok));
    assert_eq!(dc.len(), 1);
    let (cookies, names) = dc.view_sizes();
    assert_eq!(cookies, names, "both cache views stay in sync");
}

#[test]
fn plain_readdir_populates_and_then_serves_from_cache() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| {
        ok_readdir(
            vec![
                ReaddirEntry {
                    fileid: 100,
                    name: b"a".to_vec(),
                    cookie: 1,
                },
                ReaddirEntry {
                    fileid: 101,
                    name: b"b".to_vec(),
                    cookie: 2,
                },
            ],
            true,
        )
    }));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.readdir(ROOT_INO, 4096, 0, s);
    let ReplyEvent::Dir(entries) = one_reply(&rx) else {
        panic!("expected dir reply");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], ("a".to_owned(), 1));

    // Second scan and the resume-past-eof probe are both cache hits.
    let (s, rx) = sink();
    client.readdir(ROOT_INO, 4096, 0, s);
    let ReplyEvent::Dir(entries) = one_reply(&rx) else {
        panic!("expected dir reply");
    };
    assert_eq!(entries.len(), 2);

    let (s, rx) = sink();
    client.readdir(ROOT_INO, 4096, 2, s);
    let ReplyEvent::Dir(entries) = one_reply(&rx) else {
        panic!("expected dir reply");
    };
    assert!(entries.is_empty(), "past eof the listing is over");
    assert_eq!(transport.call_count(), 1, "one enumeration RPC in total");
}

#[test]
fn sequential_reads_schedule_readahead() {
    const KIB: u64 = 1024;
    let transport = MockTransport::new();
    transport.push(Box::new(|_| ok_lookup(fh(9), fattr(900, Ftype3::Reg, 64 * 1024 * 1024))));
    transport.set_fallback(|call| match call {
        ProcCall::Read(args) => (
            RpcStatus::Success,
            Some(ProcReply::Read(
                NfsStat3::Ok,
                Some(ReadRes {
                    attributes: None,
                    count: args.count,
                    eof: false,
                    data: bytes::Bytes::from(vec![7u8; args.count as usize]),
                }),
            )),
        ),
        other => panic!("unexpected call {other:?}"),
    });
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("big"), s);
    let ReplyEvent::Entry { ino, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };

    for i in 0..3u64 {
        let (s, rx) = sink();
        client.read(ino, i * 64 * KIB, 64 * 1024, s);
        let ReplyEvent::Data(data) = one_reply(&rx) else {
            panic!("expected data reply");
        };
        assert_eq!(data.len(), 64 * 1024);
    }

    let reads = transport
        .calls()
        .iter()
        .filter(|c| matches!(c, ProcCall::Read(_)))
        .count();
    // Three application reads; the third proves the stream sequential and
    // schedules a 1 MiB window of 256 KiB readahead chunks behind it.
    assert_eq!(reads, 7, "3 application reads + 4 readahead reads");

    let inode = client.inodes().get(ino).unwrap();
    let ra = inode.readahead(1024);
    assert_eq!(ra.ongoing(), 0, "all readahead completions settled");
    assert_eq!(client.tasks().free_count(), MAX_OUTSTANDING_RPC_TASKS);
}

#[test]
fn write_and_setattr_and_statfs_round_trip() {
    let transport = MockTransport::new();
    transport.push(Box::new(|_| ok_lookup(fh(3), fattr(300, Ftype3::Reg, 0))));
    transport.push(Box::new(|call| {
        let ProcCall::Write(args) = call else {
            panic!("expected write, got {call:?}");
        };
        (
            RpcStatus::Success,
            Some(ProcReply::Write(
                NfsStat3::Ok,
                Some(WriteRes {
                    attributes: Some(fattr(300, Ftype3::Reg, args.data.len() as u64)),
                    count: args.data.len() as u32,
                    verifier: [0; 8],
                }),
            )),
        )
    }));
    transport.push(Box::new(|_| {
        (
            RpcStatus::Success,
            Some(ProcReply::Setattr(
                NfsStat3::Ok,
                Some(SetattrRes {
                    attributes: Some(fattr(300, Ftype3::Reg, 0)),
                }),
            )),
        )
    }));
    transport.push(Box::new(|_| {
        (
            RpcStatus::Success,
            Some(ProcReply::Fsstat(
                NfsStat3::Ok,
                Some(FsstatRes {
                    tbytes: 1 << 40,
                    fbytes: 1 << 39,
                    abytes: 1 << 39,
                    tfiles: 1000,
                    ffiles: 500,
                    afiles: 500,
                }),
            )),
        )
    }));
    let client = test_client(&transport, test_config());

    let (s, rx) = sink();
    client.lookup(ROOT_INO, OsStr::new("f"), s);
    let ReplyEvent::Entry { ino, .. } = one_reply(&rx) else {
        panic!("expected entry reply");
    };

    let (s, rx) = sink();
    client.write(ino, 0, b"hello world", s);
    let ReplyEvent::Written(count) = one_reply(&rx) else {
        panic!("expected write reply");
    };
    assert_eq!(count, 11);
    let inode = client.inodes().get(ino).unwrap();
    assert_eq!(inode.stat().size, 11, "post-op attributes were absorbed");

    let (s, rx) = sink();
    client.setattr(
        ino,
        nfs_fs::rpc::proto::Sattr3 {
            size: Some(0),
            ..Default::default()
        },
        s,
    );
    assert!(matches!(one_reply(&rx), ReplyEvent::Attr { .. }));

    let (s, rx) = sink();
    client.statfs(ROOT_INO, s);
    let ReplyEvent::Statfs { tbytes } = one_reply(&rx) else {
        panic!("expected statfs reply");
    };
    assert_eq!(tbytes, 1 << 40);
}
