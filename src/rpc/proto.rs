//! NFSv3 and MOUNT3 wire types (RFC 1813).
//!
//! Argument and result structures for the procedures this client issues,
//! plus the status-code/errno mapping. Encoding targets the XDR layer in
//! [`crate::rpc::xdr`]; transport framing lives in [`crate::rpc::tcp`].

use bytes::Bytes;

use super::xdr::{WireError, XdrDecoder, XdrEncoder};

/// ONC-RPC program number for NFS.
pub const NFS_PROGRAM: u32 = 100_003;
/// NFS protocol version spoken by this client.
pub const NFS_V3: u32 = 3;
/// ONC-RPC program number for the MOUNT protocol.
pub const MOUNT_PROGRAM: u32 = 100_005;
/// MOUNT protocol version.
pub const MOUNT_V3: u32 = 3;

/// Maximum file handle length in NFSv3.
pub const FHSIZE3: usize = 64;
/// Maximum path/name length accepted on the wire.
pub const MAXPATHLEN: usize = 1024;
/// Cookie verifier length.
pub const COOKIEVERFSIZE: usize = 8;
/// Write verifier length.
pub const WRITEVERFSIZE: usize = 8;

/// Opaque server file handle, compared byte-wise.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fh3(Vec<u8>);

impl Fh3 {
    /// Wrap raw handle bytes. Length must not exceed [`FHSIZE3`].
    pub fn new(bytes: Vec<u8>) -> Result<Self, WireError> {
        if bytes.len() > FHSIZE3 {
            return Err(WireError::OpaqueTooLong {
                len: bytes.len(),
                limit: FHSIZE3,
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Fh3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fh3(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// NFSv3 procedure numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Proc3 {
    Null = 0,
    Getattr = 1,
    Setattr = 2,
    Lookup = 3,
    Access = 4,
    Readlink = 5,
    Read = 6,
    Write = 7,
    Create = 8,
    Mkdir = 9,
    Symlink = 10,
    Mknod = 11,
    Remove = 12,
    Rmdir = 13,
    Rename = 14,
    Link = 15,
    Readdir = 16,
    Readdirplus = 17,
    Fsstat = 18,
    Fsinfo = 19,
    Pathconf = 20,
    Commit = 21,
}

/// NFSv3 status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfsStat3 {
    Ok,
    Perm,
    Noent,
    Io,
    Nxio,
    Acces,
    Exist,
    Xdev,
    Nodev,
    Notdir,
    Isdir,
    Inval,
    Fbig,
    Nospc,
    Rofs,
    Mlink,
    Nametoolong,
    Notempty,
    Dquot,
    Stale,
    Remote,
    Badhandle,
    NotSync,
    BadCookie,
    Notsupp,
    Toosmall,
    Serverfault,
    Badtype,
    Jukebox,
}

impl NfsStat3 {
    pub fn from_wire(v: u32) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::Perm,
            2 => Self::Noent,
            5 => Self::Io,
            6 => Self::Nxio,
            13 => Self::Acces,
            17 => Self::Exist,
            18 => Self::Xdev,
            19 => Self::Nodev,
            20 => Self::Notdir,
            21 => Self::Isdir,
            22 => Self::Inval,
            27 => Self::Fbig,
            28 => Self::Nospc,
            30 => Self::Rofs,
            31 => Self::Mlink,
            63 => Self::Nametoolong,
            66 => Self::Notempty,
            69 => Self::Dquot,
            70 => Self::Stale,
            71 => Self::Remote,
            10_001 => Self::Badhandle,
            10_002 => Self::NotSync,
            10_003 => Self::BadCookie,
            10_004 => Self::Notsupp,
            10_005 => Self::Toosmall,
            10_006 => Self::Serverfault,
            10_007 => Self::Badtype,
            10_008 => Self::Jukebox,
            d => return Err(WireError::BadDiscriminant(d)),
        })
    }

    /// Errors worth retrying for an idempotent operation. Everything else
    /// is terminal.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Io | Self::Serverfault | Self::Rofs | Self::Perm)
    }

    /// Map to the POSIX errno reported upstream.
    pub fn to_errno(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Perm => libc::EPERM,
            Self::Noent => libc::ENOENT,
            Self::Io => libc::EIO,
            Self::Nxio => libc::ENXIO,
            Self::Acces => libc::EACCES,
            Self::Exist => libc::EEXIST,
            Self::Xdev => libc::EXDEV,
            Self::Nodev => libc::ENODEV,
            Self::Notdir => libc::ENOTDIR,
            Self::Isdir => libc::EISDIR,
            Self::Inval => libc::EINVAL,
            Self::Fbig => libc::EFBIG,
            Self::Nospc => libc::ENOSPC,
            Self::Rofs => libc::EROFS,
            Self::Mlink => libc::EMLINK,
            Self::Nametoolong => libc::ENAMETOOLONG,
            Self::Notempty => libc::ENOTEMPTY,
            Self::Dquot => libc::EDQUOT,
            Self::Stale | Self::Badhandle => libc::ESTALE,
            Self::Remote => libc::EREMOTE,
            Self::Notsupp => libc::ENOSYS,
            Self::Badtype => libc::EINVAL,
            Self::Jukebox => libc::EAGAIN,
            Self::NotSync | Self::BadCookie | Self::Toosmall | Self::Serverfault => libc::EIO,
        }
    }
}

/// NFSv3 timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nfstime3 {
    pub seconds: u32,
    pub nseconds: u32,
}

impl Nfstime3 {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, WireError> {
        Ok(Self {
            seconds: dec.get_u32()?,
            nseconds: dec.get_u32()?,
        })
    }

    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_u32(self.seconds);
        enc.put_u32(self.nseconds);
    }
}

/// NFSv3 file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ftype3 {
    Reg,
    Dir,
    Blk,
    Chr,
    Lnk,
    Sock,
    Fifo,
}

impl Ftype3 {
    fn from_wire(v: u32) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::Reg,
            2 => Self::Dir,
            3 => Self::Blk,
            4 => Self::Chr,
            5 => Self::Lnk,
            6 => Self::Sock,
            7 => Self::Fifo,
            d => return Err(WireError::BadDiscriminant(d)),
        })
    }
}

/// Full file attributes as returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fattr3 {
    pub ftype: Ftype3,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub rdev: (u32, u32),
    pub fsid: u64,
    pub fileid: u64,
    pub atime: Nfstime3,
    pub mtime: Nfstime3,
    pub ctime: Nfstime3,
}

impl Fattr3 {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, WireError> {
        Ok(Self {
            ftype: Ftype3::from_wire(dec.get_u32()?)?,
            mode: dec.get_u32()?,
            nlink: dec.get_u32()?,
            uid: dec.get_u32()?,
            gid: dec.get_u32()?,
            size: dec.get_u64()?,
            used: dec.get_u64()?,
            rdev: (dec.get_u32()?, dec.get_u32()?),
            fsid: dec.get_u64()?,
            fileid: dec.get_u64()?,
            atime: Nfstime3::decode(dec)?,
            mtime: Nfstime3::decode(dec)?,
            ctime: Nfstime3::decode(dec)?,
        })
    }
}

/// `post_op_attr`: attributes the server may or may not attach.
fn decode_post_op_attr(dec: &mut XdrDecoder<'_>) -> Result<Option<Fattr3>, WireError> {
    if dec.get_bool()? {
        Ok(Some(Fattr3::decode(dec)?))
    } else {
        Ok(None)
    }
}

/// `wcc_data`: pre-op size/times plus post-op attributes. The pre-op half
/// is consumed and discarded; only the post-op attributes are surfaced.
fn decode_wcc_data(dec: &mut XdrDecoder<'_>) -> Result<Option<Fattr3>, WireError> {
    if dec.get_bool()? {
        // wcc_attr: size, mtime, ctime
        dec.get_u64()?;
        Nfstime3::decode(dec)?;
        Nfstime3::decode(dec)?;
    }
    decode_post_op_attr(dec)
}

fn decode_post_op_fh(dec: &mut XdrDecoder<'_>) -> Result<Option<Fh3>, WireError> {
    if dec.get_bool()? {
        Ok(Some(Fh3::new(dec.get_opaque(FHSIZE3)?)?))
    } else {
        Ok(None)
    }
}

/// How to set a time field in SETATTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeHow {
    #[default]
    DontChange,
    ServerTime,
    ClientTime(Nfstime3),
}

impl TimeHow {
    fn encode(&self, enc: &mut XdrEncoder) {
        match self {
            Self::DontChange => enc.put_u32(0),
            Self::ServerTime => enc.put_u32(1),
            Self::ClientTime(t) => {
                enc.put_u32(2);
                t.encode(enc);
            }
        }
    }
}

/// Settable attribute subset (`sattr3`). `None` fields are left untouched
/// by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sattr3 {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: TimeHow,
    pub mtime: TimeHow,
}

impl Sattr3 {
    fn encode(&self, enc: &mut XdrEncoder) {
        fn put_opt_u32(enc: &mut XdrEncoder, v: Option<u32>) {
            match v {
                Some(v) => {
                    enc.put_bool(true);
                    enc.put_u32(v);
                }
                None => enc.put_bool(false),
            }
        }
        put_opt_u32(enc, self.mode);
        put_opt_u32(enc, self.uid);
        put_opt_u32(enc, self.gid);
        match self.size {
            Some(v) => {
                enc.put_bool(true);
                enc.put_u64(v);
            }
            None => enc.put_bool(false),
        }
        self.atime.encode(enc);
        self.mtime.encode(enc);
    }
}

// ── Per-procedure arguments ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GetattrArgs {
    pub object: Fh3,
}

#[derive(Debug, Clone)]
pub struct SetattrArgs {
    pub object: Fh3,
    pub new_attributes: Sattr3,
}

#[derive(Debug, Clone)]
pub struct DirOpArgs {
    pub dir: Fh3,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReadArgs {
    pub file: Fh3,
    pub offset: u64,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct WriteArgs {
    pub file: Fh3,
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub dir: Fh3,
    pub name: Vec<u8>,
    pub attributes: Sattr3,
}

#[derive(Debug, Clone)]
pub struct ReaddirArgs {
    pub dir: Fh3,
    pub cookie: u64,
    pub verifier: [u8; COOKIEVERFSIZE],
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct ReaddirplusArgs {
    pub dir: Fh3,
    pub cookie: u64,
    pub verifier: [u8; COOKIEVERFSIZE],
    pub dircount: u32,
    pub maxcount: u32,
}

#[derive(Debug, Clone)]
pub struct FsstatArgs {
    pub root: Fh3,
}

/// A fully-formed call, ready for the transport.
#[derive(Debug, Clone)]
pub enum ProcCall {
    Null,
    Getattr(GetattrArgs),
    Setattr(SetattrArgs),
    Lookup(DirOpArgs),
    Read(ReadArgs),
    Write(WriteArgs),
    Create(CreateArgs),
    Mkdir(CreateArgs),
    Remove(DirOpArgs),
    Rmdir(DirOpArgs),
    Readdir(ReaddirArgs),
    Readdirplus(ReaddirplusArgs),
    Fsstat(FsstatArgs),
}

impl ProcCall {
    pub fn proc(&self) -> Proc3 {
        match self {
            Self::Null => Proc3::Null,
            Self::Getattr(_) => Proc3::Getattr,
            Self::Setattr(_) => Proc3::Setattr,
            Self::Lookup(_) => Proc3::Lookup,
            Self::Read(_) => Proc3::Read,
            Self::Write(_) => Proc3::Write,
            Self::Create(_) => Proc3::Create,
            Self::Mkdir(_) => Proc3::Mkdir,
            Self::Remove(_) => Proc3::Remove,
            Self::Rmdir(_) => Proc3::Rmdir,
            Self::Readdir(_) => Proc3::Readdir,
            Self::Readdirplus(_) => Proc3::Readdirplus,
            Self::Fsstat(_) => Proc3::Fsstat,
        }
    }

    pub fn encode(&self, enc: &mut XdrEncoder) {
        fn put_fh(enc: &mut XdrEncoder, fh: &Fh3) {
            enc.put_opaque(fh.as_bytes());
        }
        fn put_dirop(enc: &mut XdrEncoder, a: &DirOpArgs) {
            put_fh(enc, &a.dir);
            enc.put_opaque(&a.name);
        }
        match self {
            Self::Null => {}
            Self::Getattr(a) => put_fh(enc, &a.object),
            Self::Setattr(a) => {
                put_fh(enc, &a.object);
                a.new_attributes.encode(enc);
                // guard: no ctime check
                enc.put_bool(false);
            }
            Self::Lookup(a) | Self::Remove(a) | Self::Rmdir(a) => put_dirop(enc, a),
            Self::Read(a) => {
                put_fh(enc, &a.file);
                enc.put_u64(a.offset);
                enc.put_u32(a.count);
            }
            Self::Write(a) => {
                put_fh(enc, &a.file);
                enc.put_u64(a.offset);
                enc.put_u32(a.data.len() as u32);
                // stable = FILE_SYNC: no COMMIT pass in this client
                enc.put_u32(2);
                enc.put_opaque(&a.data);
            }
            Self::Create(a) => {
                put_fh(enc, &a.dir);
                enc.put_opaque(&a.name);
                // createhow3 = UNCHECKED
                enc.put_u32(0);
                a.attributes.encode(enc);
            }
            Self::Mkdir(a) => {
                put_fh(enc, &a.dir);
                enc.put_opaque(&a.name);
                a.attributes.encode(enc);
            }
            Self::Readdir(a) => {
                put_fh(enc, &a.dir);
                enc.put_u64(a.cookie);
                enc.put_opaque_fixed(&a.verifier);
                enc.put_u32(a.count);
            }
            Self::Readdirplus(a) => {
                put_fh(enc, &a.dir);
                enc.put_u64(a.cookie);
                enc.put_opaque_fixed(&a.verifier);
                enc.put_u32(a.dircount);
                enc.put_u32(a.maxcount);
            }
            Self::Fsstat(a) => put_fh(enc, &a.root),
        }
    }
}

// ── Per-procedure results ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GetattrRes {
    pub attributes: Fattr3,
}

#[derive(Debug, Clone)]
pub struct SetattrRes {
    pub attributes: Option<Fattr3>,
}

#[derive(Debug, Clone)]
pub struct LookupRes {
    pub object: Fh3,
    pub attributes: Option<Fattr3>,
    pub dir_attributes: Option<Fattr3>,
}

#[derive(Debug, Clone)]
pub struct ReadRes {
    pub attributes: Option<Fattr3>,
    pub count: u32,
    pub eof: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct WriteRes {
    pub attributes: Option<Fattr3>,
    pub count: u32,
    pub verifier: [u8; WRITEVERFSIZE],
}

#[derive(Debug, Clone)]
pub struct CreateRes {
    pub object: Option<Fh3>,
    pub attributes: Option<Fattr3>,
}

#[derive(Debug, Clone)]
pub struct RemoveRes {
    pub dir_attributes: Option<Fattr3>,
}

#[derive(Debug, Clone)]
pub struct ReaddirEntry {
    pub fileid: u64,
    pub name: Vec<u8>,
    pub cookie: u64,
}

#[derive(Debug, Clone)]
pub struct ReaddirRes {
    pub dir_attributes: Option<Fattr3>,
    pub verifier: [u8; COOKIEVERFSIZE],
    pub entries: Vec<ReaddirEntry>,
    pub eof: bool,
}

#[derive(Debug, Clone)]
pub struct ReaddirplusEntry {
    pub fileid: u64,
    pub name: Vec<u8>,
    pub cookie: u64,
    pub attributes: Option<Fattr3>,
    pub handle: Option<Fh3>,
}

#[derive(Debug, Clone)]
pub struct ReaddirplusRes {
    pub dir_attributes: Option<Fattr3>,
    pub verifier: [u8; COOKIEVERFSIZE],
    pub entries: Vec<ReaddirplusEntry>,
    pub eof: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FsstatRes {
    pub tbytes: u64,
    pub fbytes: u64,
    pub abytes: u64,
    pub tfiles: u64,
    pub ffiles: u64,
    pub afiles: u64,
}

/// Decoded reply body. The status is carried alongside the body so the
/// retry machine can classify failures without caring about the shape.
#[derive(Debug, Clone)]
pub enum ProcReply {
    Void,
    Getattr(NfsStat3, Option<GetattrRes>),
    Setattr(NfsStat3, Option<SetattrRes>),
    Lookup(NfsStat3, Option<LookupRes>),
    Read(NfsStat3, Option<ReadRes>),
    Write(NfsStat3, Option<WriteRes>),
    Create(NfsStat3, Option<CreateRes>),
    Mkdir(NfsStat3, Option<CreateRes>),
    Remove(NfsStat3, Option<RemoveRes>),
    Rmdir(NfsStat3, Option<RemoveRes>),
    Readdir(NfsStat3, Option<ReaddirRes>),
    Readdirplus(NfsStat3, Option<ReaddirplusRes>),
    Fsstat(NfsStat3, Option<FsstatRes>),
}

impl ProcReply {
    pub fn status(&self) -> NfsStat3 {
        match self {
            Self::Void => NfsStat3::Ok,
            Self::Getattr(s, _)
            | Self::Setattr(s, _)
            | Self::Lookup(s, _)
            | Self::Read(s, _)
            | Self::Write(s, _)
            | Self::Create(s, _)
            | Self::Mkdir(s, _)
            | Self::Remove(s, _)
            | Self::Rmdir(s, _)
            | Self::Readdir(s, _)
            | Self::Readdirplus(s, _)
            | Self::Fsstat(s, _) => *s,
        }
    }
}

fn decode_readdir_entries(dec: &mut XdrDecoder<'_>) -> Result<Vec<ReaddirEntry>, WireError> {
    let mut entries = Vec::new();
    while dec.get_bool()? {
        entries.push(ReaddirEntry {
            fileid: dec.get_u64()?,
            name: dec.get_opaque(MAXPATHLEN)?,
            cookie: dec.get_u64()?,
        });
    }
    Ok(entries)
}

fn decode_readdirplus_entries(
    dec: &mut XdrDecoder<'_>,
) -> Result<Vec<ReaddirplusEntry>, WireError> {
    let mut entries = Vec::new();
    while dec.get_bool()? {
        entries.push(ReaddirplusEntry {
            fileid: dec.get_u64()?,
            name: dec.get_opaque(MAXPATHLEN)?,
            cookie: dec.get_u64()?,
            attributes: decode_post_op_attr(dec)?,
            handle: decode_post_op_fh(dec)?,
        });
    }
    Ok(entries)
}

fn verifier(dec: &mut XdrDecoder<'_>) -> Result<[u8; COOKIEVERFSIZE], WireError> {
    let raw = dec.get_opaque_fixed(COOKIEVERFSIZE)?;
    let mut v = [0u8; COOKIEVERFSIZE];
    v.copy_from_slice(raw);
    Ok(v)
}

/// Decode a reply body for `proc`. Failure bodies only surface the status;
/// their trailing attributes are consumed where required and discarded.
pub fn decode_reply(proc: Proc3, dec: &mut XdrDecoder<'_>) -> Result<ProcReply, WireError> {
    if proc == Proc3::Null {
        return Ok(ProcReply::Void);
    }
    let status = NfsStat3::from_wire(dec.get_u32()?)?;
    let ok = status == NfsStat3::Ok;

    Ok(match proc {
        Proc3::Getattr => ProcReply::Getattr(
            status,
            ok.then(|| Fattr3::decode(dec).map(|attributes| GetattrRes { attributes }))
                .transpose()?,
        ),
        Proc3::Setattr => {
            let attributes = decode_wcc_data(dec)?;
            ProcReply::Setattr(status, ok.then_some(SetattrRes { attributes }))
        }
        Proc3::Lookup => {
            if ok {
                let object = Fh3::new(dec.get_opaque(FHSIZE3)?)?;
                let attributes = decode_post_op_attr(dec)?;
                let dir_attributes = decode_post_op_attr(dec)?;
                ProcReply::Lookup(
                    status,
                    Some(LookupRes {
                        object,
                        attributes,
                        dir_attributes,
                    }),
                )
            } else {
                ProcReply::Lookup(status, None)
            }
        }
        Proc3::Read => {
            let attributes = decode_post_op_attr(dec)?;
            if ok {
                let count = dec.get_u32()?;
                let eof = dec.get_bool()?;
                let data = Bytes::from(dec.get_opaque(u32::MAX as usize)?);
                ProcReply::Read(
                    status,
                    Some(ReadRes {
                        attributes,
                        count,
                        eof,
                        data,
                    }),
                )
            } else {
                ProcReply::Read(status, None)
            }
        }
        Proc3::Write => {
            let attributes = decode_wcc_data(dec)?;
            if ok {
                let count = dec.get_u32()?;
                // committed (ignored: we always write FILE_SYNC)
                dec.get_u32()?;
                let raw = dec.get_opaque_fixed(WRITEVERFSIZE)?;
                let mut v = [0u8; WRITEVERFSIZE];
                v.copy_from_slice(raw);
                ProcReply::Write(
                    status,
                    Some(WriteRes {
                        attributes,
                        count,
                        verifier: v,
                    }),
                )
            } else {
                ProcReply::Write(status, None)
            }
        }
        Proc3::Create | Proc3::Mkdir => {
            let body = if ok {
                let object = decode_post_op_fh(dec)?;
                let attributes = decode_post_op_attr(dec)?;
                decode_wcc_data(dec)?;
                Some(CreateRes { object, attributes })
            } else {
                None
            };
            if proc == Proc3::Create {
                ProcReply::Create(status, body)
            } else {
                ProcReply::Mkdir(status, body)
            }
        }
        Proc3::Remove | Proc3::Rmdir => {
            let dir_attributes = decode_wcc_data(dec)?;
            let body = ok.then_some(RemoveRes { dir_attributes });
            if proc == Proc3::Remove {
                ProcReply::Remove(status, body)
            } else {
                ProcReply::Rmdir(status, body)
            }
        }
        Proc3::Readdir => {
            if ok {
                let dir_attributes = decode_post_op_attr(dec)?;
                let v = verifier(dec)?;
                let entries = decode_readdir_entries(dec)?;
                let eof = dec.get_bool()?;
                ProcReply::Readdir(
                    status,
                    Some(ReaddirRes {
                        dir_attributes,
                        verifier: v,
                        entries,
                        eof,
                    }),
                )
            } else {
                ProcReply::Readdir(status, None)
            }
        }
        Proc3::Readdirplus => {
            if ok {
                let dir_attributes = decode_post_op_attr(dec)?;
                let v = verifier(dec)?;
                let entries = decode_readdirplus_entries(dec)?;
                let eof = dec.get_bool()?;
                ProcReply::Readdirplus(
                    status,
                    Some(ReaddirplusRes {
                        dir_attributes,
                        verifier: v,
                        entries,
                        eof,
                    }),
                )
            } else {
                ProcReply::Readdirplus(status, None)
            }
        }
        Proc3::Fsstat => {
            decode_post_op_attr(dec)?;
            if ok {
                ProcReply::Fsstat(
                    status,
                    Some(FsstatRes {
                        tbytes: dec.get_u64()?,
                        fbytes: dec.get_u64()?,
                        abytes: dec.get_u64()?,
                        tfiles: dec.get_u64()?,
                        ffiles: dec.get_u64()?,
                        afiles: dec.get_u64()?,
                    }),
                )
            } else {
                ProcReply::Fsstat(status, None)
            }
        }
        Proc3::Null
        | Proc3::Access
        | Proc3::Readlink
        | Proc3::Symlink
        | Proc3::Mknod
        | Proc3::Rename
        | Proc3::Link
        | Proc3::Fsinfo
        | Proc3::Pathconf
        | Proc3::Commit => return Err(WireError::BadDiscriminant(proc as u32)),
    })
}

// ── MOUNT3 ──────────────────────────────────────────────────────────────

/// Encode a MOUNT3 `MNT` call body for the export path.
pub fn encode_mnt(enc: &mut XdrEncoder, export: &str) {
    enc.put_str(export);
}

/// Decode a MOUNT3 `MNT` reply. Returns the root file handle on success,
/// or the mount status code on failure.
pub fn decode_mnt_reply(dec: &mut XdrDecoder<'_>) -> Result<Result<Fh3, u32>, WireError> {
    let status = dec.get_u32()?;
    if status != 0 {
        return Ok(Err(status));
    }
    let fh = Fh3::new(dec.get_opaque(FHSIZE3)?)?;
    // auth flavor list, unused
    let n = dec.get_u32()?;
    for _ in 0..n {
        dec.get_u32()?;
    }
    Ok(Ok(fh))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(call: &ProcCall) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        call.encode(&mut enc);
        enc.into_bytes()
    }

    #[test]
    fn lookup_args_encode_dir_then_name() {
        let fh = Fh3::new(vec![0xaa; 16]).expect("handle fits");
        let buf = encode(&ProcCall::Lookup(DirOpArgs {
            dir: fh,
            name: b"hello".to_vec(),
        }));
        let mut dec = XdrDecoder::new(&buf);
        assert_eq!(dec.get_opaque(FHSIZE3), Ok(vec![0xaa; 16]));
        assert_eq!(dec.get_opaque(MAXPATHLEN), Ok(b"hello".to_vec()));
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn oversized_handle_is_rejected() {
        assert!(Fh3::new(vec![0; FHSIZE3 + 1]).is_err());
    }

    #[test]
    fn getattr_reply_round_trip() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(0); // NFS3_OK
        enc.put_u32(1); // NF3REG
        enc.put_u32(0o644);
        enc.put_u32(1); // nlink
        enc.put_u32(1000);
        enc.put_u32(1000);
        enc.put_u64(4096); // size
        enc.put_u64(4096); // used
        enc.put_u32(0);
        enc.put_u32(0); // rdev
        enc.put_u64(7); // fsid
        enc.put_u64(42); // fileid
        for _ in 0..3 {
            enc.put_u32(1_700_000_000);
            enc.put_u32(0);
        }
        let buf = enc.into_bytes();

        let mut dec = XdrDecoder::new(&buf);
        let reply = decode_reply(Proc3::Getattr, &mut dec).expect("valid body");
        let ProcReply::Getattr(status, Some(res)) = reply else {
            panic!("expected decoded getattr body");
        };
        assert_eq!(status, NfsStat3::Ok);
        assert_eq!(res.attributes.fileid, 42);
        assert_eq!(res.attributes.size, 4096);
        assert_eq!(res.attributes.ftype, Ftype3::Reg);
    }

    #[test]
    fn error_reply_carries_status_only() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(70); // NFS3ERR_STALE
        let buf = enc.into_bytes();
        let mut dec = XdrDecoder::new(&buf);
        let ProcReply::Getattr(status, body) =
            decode_reply(Proc3::Getattr, &mut dec).expect("valid body")
        else {
            panic!("wrong arm");
        };
        assert_eq!(status, NfsStat3::Stale);
        assert!(body.is_none());
    }

    #[test]
    fn readdir_entry_list_decodes_until_sentinel() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(0); // OK
        enc.put_bool(false); // no dir attributes
        enc.put_opaque_fixed(&[0u8; COOKIEVERFSIZE]);
        for (i, name) in [b"a".as_slice(), b"b".as_slice()].iter().enumerate() {
            enc.put_bool(true);
            enc.put_u64(100 + i as u64);
            enc.put_opaque(name);
            enc.put_u64(1 + i as u64);
        }
        enc.put_bool(false); // end of list
        enc.put_bool(true); // eof
        let buf = enc.into_bytes();

        let mut dec = XdrDecoder::new(&buf);
        let ProcReply::Readdir(status, Some(res)) =
            decode_reply(Proc3::Readdir, &mut dec).expect("valid body")
        else {
            panic!("wrong arm");
        };
        assert_eq!(status, NfsStat3::Ok);
        assert_eq!(res.entries.len(), 2);
        assert_eq!(res.entries[1].cookie, 2);
        assert!(res.eof);
    }

    #[test]
    fn retryable_set_matches_policy() {
        for s in [
            NfsStat3::Io,
            NfsStat3::Serverfault,
            NfsStat3::Rofs,
            NfsStat3::Perm,
        ] {
            assert!(s.is_retryable(), "{s:?} should be retryable");
        }
        for s in [NfsStat3::Noent, NfsStat3::Stale, NfsStat3::Acces] {
            assert!(!s.is_retryable(), "{s:?} should be terminal");
        }
    }

    #[test]
    fn mnt_reply_round_trip() {
        let mut enc = XdrEncoder::new();
        enc.put_u32(0);
        enc.put_opaque(&[1, 2, 3, 4]);
        enc.put_u32(1);
        enc.put_u32(1); // AUTH_UNIX
        let buf = enc.into_bytes();
        let mut dec = XdrDecoder::new(&buf);
        let fh = decode_mnt_reply(&mut dec)
            .expect("valid body")
            .expect("mount ok");
        assert_eq!(fh.as_bytes(), &[1, 2, 3, 4]);
    }
}
