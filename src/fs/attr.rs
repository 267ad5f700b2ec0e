//! Cached attribute model: the client-side view of `fattr3`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::rpc::proto::{Fattr3, Ftype3, Nfstime3};

/// Block size reported to the kernel.
pub const NFS_BLKSIZE: u32 = 4096;

/// File kind, collapsed from `ftype3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
}

impl From<Ftype3> for FileKind {
    fn from(t: Ftype3) -> Self {
        match t {
            Ftype3::Reg => Self::Regular,
            Ftype3::Dir => Self::Directory,
            Ftype3::Lnk => Self::Symlink,
            Ftype3::Blk => Self::BlockDevice,
            Ftype3::Chr => Self::CharDevice,
            Ftype3::Sock => Self::Socket,
            Ftype3::Fifo => Self::Fifo,
        }
    }
}

impl From<FileKind> for fuser::FileType {
    fn from(k: FileKind) -> Self {
        match k {
            FileKind::Regular => Self::RegularFile,
            FileKind::Directory => Self::Directory,
            FileKind::Symlink => Self::Symlink,
            FileKind::BlockDevice => Self::BlockDevice,
            FileKind::CharDevice => Self::CharDevice,
            FileKind::Socket => Self::Socket,
            FileKind::Fifo => Self::NamedPipe,
        }
    }
}

fn to_system_time(t: Nfstime3) -> SystemTime {
    UNIX_EPOCH + Duration::new(u64::from(t.seconds), t.nseconds)
}

/// Server attributes translated for upstream consumption.
///
/// `fileid` is the server-side id; the upstream inode number is chosen by
/// the inode table and substituted in [`FileStat::to_fuse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub fileid: u64,
    pub kind: FileKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub fsid: u64,
    pub rdev: (u32, u32),
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl From<&Fattr3> for FileStat {
    fn from(a: &Fattr3) -> Self {
        Self {
            fileid: a.fileid,
            kind: a.ftype.into(),
            mode: a.mode,
            nlink: a.nlink,
            uid: a.uid,
            gid: a.gid,
            size: a.size,
            used: a.used,
            fsid: a.fsid,
            rdev: a.rdev,
            atime: to_system_time(a.atime),
            mtime: to_system_time(a.mtime),
            ctime: to_system_time(a.ctime),
        }
    }
}

impl FileStat {
    /// Placeholder for entries known only by fileid (plain READDIR gives
    /// no attributes).
    pub fn stub(fileid: u64) -> Self {
        Self {
            fileid,
            kind: FileKind::Regular,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            used: 0,
            fsid: 0,
            rdev: (0, 0),
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }

    /// Render for the kernel bridge under the given upstream inode number.
    pub fn to_fuse(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: (self.used + 511) >> 9,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: UNIX_EPOCH,
            kind: self.kind.into(),
            perm: (self.mode & 0o7777) as u16,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: (self.rdev.0 << 20) | (self.rdev.1 & 0xfffff),
            blksize: NFS_BLKSIZE,
            flags: 0,
        }
    }
}
