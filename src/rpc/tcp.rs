//! Record-marked ONC-RPC over TCP (RFC 5531), the production backend
//! behind [`NfsTransport`].
//!
//! Each connection owns the socket plus one service thread that reads
//! replies, matches them to pending calls by xid, and runs completion
//! callbacks. Submissions may come from any thread; the write half is
//! serialized by a mutex. The MOUNT3 handshake happens synchronously at
//! connect time, before the service thread takes over the read half.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::proto::{
    self, Fh3, Proc3, ProcCall, MOUNT_PROGRAM, MOUNT_V3, NFS_PROGRAM, NFS_V3,
};
use super::transport::{NfsTransport, OnDone, RpcStatus, SubmitError};
use super::xdr::{WireError, XdrDecoder, XdrEncoder};

const RPC_VERSION: u32 = 2;
const CALL: u32 = 0;
const REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NONE: u32 = 0;
const AUTH_UNIX: u32 = 1;
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest reply record we are willing to buffer (a full READ plus slack).
const MAX_RECORD: usize = 4 * 1024 * 1024;

/// Connection-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed server message: {0}")]
    Wire(#[from] WireError),

    #[error("server rejected the RPC call")]
    Rejected,

    #[error("mount failed with status {0}")]
    MountFailed(u32),

    #[error("could not resolve server address {0}")]
    Resolve(String),
}

/// AUTH_UNIX credentials attached to every call.
#[derive(Debug, Clone)]
pub struct AuthUnix {
    pub uid: u32,
    pub gid: u32,
    pub machine: String,
}

impl AuthUnix {
    fn encode(&self, enc: &mut XdrEncoder) {
        let mut body = XdrEncoder::new();
        body.put_u32(0); // stamp
        body.put_str(&self.machine);
        body.put_u32(self.uid);
        body.put_u32(self.gid);
        body.put_u32(0); // no auxiliary gids
        enc.put_u32(AUTH_UNIX);
        enc.put_opaque(&body.into_bytes());
        // verifier: AUTH_NONE
        enc.put_u32(AUTH_NONE);
        enc.put_u32(0);
    }
}

struct Pending {
    proc: Proc3,
    done: OnDone,
}

/// A mounted, serviced connection ready for the pool.
pub struct MountedConnection {
    pub transport: Arc<TcpTransport>,
    pub root_fh: Fh3,
    pub service: JoinHandle<()>,
}

/// One TCP connection to the server.
pub struct TcpTransport {
    writer: Mutex<TcpStream>,
    pending: Arc<Mutex<HashMap<u32, Pending>>>,
    next_xid: AtomicU32,
    closed: Arc<AtomicBool>,
    cred: AuthUnix,
}

impl TcpTransport {
    /// Connect, perform the MOUNT3 handshake for `export`, and start the
    /// reply service thread.
    pub fn connect(
        server: &str,
        port: u16,
        export: &str,
        cred: AuthUnix,
    ) -> Result<MountedConnection, TransportError> {
        let addr = (server, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{server}:{port}")))?;
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let root_fh = mount_export(&mut stream, export, &cred)?;
        debug!(server, export, ?root_fh, "mounted export");

        let reader = stream.try_clone()?;
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(Self {
            writer: Mutex::new(stream),
            pending: Arc::clone(&pending),
            // xid 0 is reserved for the mount handshake
            next_xid: AtomicU32::new(1),
            closed: Arc::clone(&closed),
            cred,
        });

        let service = std::thread::Builder::new()
            .name(format!("nfs-rpc-{server}"))
            .spawn(move || service_loop(reader, &pending, &closed))?;

        Ok(MountedConnection {
            transport,
            root_fh,
            service,
        })
    }

    /// Shut the connection down. Pending calls complete with an error on
    /// the service thread, which then exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let stream = self.writer.lock().expect("poisoned");
        let _ = stream.shutdown(Shutdown::Both);
    }
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
impl NfsTransport for TcpTransport {
    fn submit(&self, call: &ProcCall, done: OnDone) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }

        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let mut enc = XdrEncoder::new();
        enc.put_u32(xid);
        enc.put_u32(CALL);
        enc.put_u32(RPC_VERSION);
        enc.put_u32(NFS_PROGRAM);
        enc.put_u32(NFS_V3);
        enc.put_u32(call.proc() as u32);
        self.cred.encode(&mut enc);
        call.encode(&mut enc);
        let body = enc.into_bytes();

        // Register before writing so a fast reply cannot miss the entry.
        self.pending.lock().expect("poisoned").insert(
            xid,
            Pending {
                proc: call.proc(),
                done,
            },
        );

        let result = {
            let mut stream = self.writer.lock().expect("poisoned");
            write_record(&mut *stream, &body)
        };

        if let Err(e) = result {
            warn!(xid, error = %e, "rpc send failed, closing connection");
            self.pending.lock().expect("poisoned").remove(&xid);
            self.close();
            return Err(SubmitError::Closed);
        }

        trace!(xid, op = ?call.proc(), "rpc call sent");
        Ok(())
    }

    fn healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

fn write_record(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let marker = (LAST_FRAGMENT | body.len() as u32).to_be_bytes();
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&marker);
    framed.extend_from_slice(body);
    stream.write_all(&framed)
}

/// Read one record-marked message, reassembling fragments.
fn read_record(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut record = Vec::new();
    loop {
        let mut marker = [0u8; 4];
        stream.read_exact(&mut marker)?;
        let word = u32::from_be_bytes(marker);
        let len = (word & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            return Err(WireError::OpaqueTooLong {
                len: record.len() + len,
                limit: MAX_RECORD,
            }
            .into());
        }
        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..])?;
        if word & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// Parse the RPC reply header. Returns the xid and whether the call was
/// accepted and executed.
fn parse_reply_header(dec: &mut XdrDecoder<'_>) -> Result<(u32, bool), WireError> {
    let xid = dec.get_u32()?;
    let mtype = dec.get_u32()?;
    if mtype != REPLY {
        return Err(WireError::BadDiscriminant(mtype));
    }
    let reply_stat = dec.get_u32()?;
    if reply_stat != MSG_ACCEPTED {
        return Ok((xid, false));
    }
    // verifier
    dec.get_u32()?;
    dec.skip_opaque()?;
    let accept_stat = dec.get_u32()?;
    Ok((xid, accept_stat == ACCEPT_SUCCESS))
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
fn service_loop(
    mut reader: TcpStream,
    pending: &Arc<Mutex<HashMap<u32, Pending>>>,
    closed: &Arc<AtomicBool>,
) {
    loop {
        let record = match read_record(&mut reader) {
            Ok(r) => r,
            Err(e) => {
                if !closed.load(Ordering::Acquire) {
                    warn!(error = %e, "rpc connection lost");
                }
                break;
            }
        };

        let mut dec = XdrDecoder::new(&record);
        let (xid, accepted) = match parse_reply_header(&mut dec) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "unparseable rpc reply header, dropping connection");
                break;
            }
        };

        let Some(entry) = pending.lock().expect("poisoned").remove(&xid) else {
            warn!(xid, "reply for unknown xid, ignoring");
            continue;
        };

        if !accepted {
            (entry.done)(RpcStatus::Error, None);
            continue;
        }

        match proto::decode_reply(entry.proc, &mut dec) {
            Ok(reply) => {
                trace!(xid, op = ?entry.proc, status = ?reply.status(), "rpc reply");
                (entry.done)(RpcStatus::Success, Some(reply));
            }
            Err(e) => {
                warn!(xid, op = ?entry.proc, error = %e, "undecodable reply body");
                (entry.done)(RpcStatus::Error, None);
            }
        }
    }

    closed.store(true, Ordering::Release);
    let drained: Vec<Pending> = pending
        .lock()
        .expect("poisoned")
        .drain()
        .map(|(_, p)| p)
        .collect();
    if !drained.is_empty() {
        debug!(count = drained.len(), "failing calls pending on dead connection");
    }
    for p in drained {
        (p.done)(RpcStatus::Error, None);
    }
}

/// Synchronous MOUNT3 `MNT` exchange, performed before the service thread
/// owns the read half.
fn mount_export(
    stream: &mut TcpStream,
    export: &str,
    cred: &AuthUnix,
) -> Result<Fh3, TransportError> {
    let mut enc = XdrEncoder::new();
    enc.put_u32(0); // xid reserved for the handshake
    enc.put_u32(CALL);
    enc.put_u32(RPC_VERSION);
    enc.put_u32(MOUNT_PROGRAM);
    enc.put_u32(MOUNT_V3);
    enc.put_u32(1); // MOUNTPROC3_MNT
    cred.encode(&mut enc);
    proto::encode_mnt(&mut enc, export);
    write_record(stream, &enc.into_bytes())?;

    let record = read_record(stream)?;
    let mut dec = XdrDecoder::new(&record);
    let (_, accepted) = parse_reply_header(&mut dec)?;
    if !accepted {
        return Err(TransportError::Rejected);
    }
    match proto::decode_mnt_reply(&mut dec)? {
        Ok(fh) => Ok(fh),
        Err(status) => Err(TransportError::MountFailed(status)),
    }
}
