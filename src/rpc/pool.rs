//! Connection pool: `nconnect` parallel RPC connections to one server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use super::proto::Fh3;
use super::tcp::{AuthUnix, TcpTransport, TransportError};
use super::transport::NfsTransport;

struct Connection {
    transport: Arc<dyn NfsTransport>,
    service: Option<JoinHandle<()>>,
}

/// Round-robins calls over `nconnect` independent connections, each with
/// its own service thread. All connections are mounted against the same
/// export; the root handle from the first mount is authoritative.
pub struct ConnectionPool {
    connections: Vec<Connection>,
    next: AtomicUsize,
    root_fh: Fh3,
    tcp: Vec<Arc<TcpTransport>>,
}

impl ConnectionPool {
    /// Open `nconnect` connections to `server:port` and mount `export` on
    /// each.
    pub fn start(
        server: &str,
        port: u16,
        export: &str,
        nconnect: usize,
        cred: &AuthUnix,
    ) -> Result<Self, TransportError> {
        assert!(nconnect >= 1);

        let mut connections = Vec::with_capacity(nconnect);
        let mut tcp = Vec::with_capacity(nconnect);
        let mut root_fh = None;

        for i in 0..nconnect {
            let mounted = TcpTransport::connect(server, port, export, cred.clone())?;
            info!(server, export, connection = i, "rpc connection up");
            root_fh.get_or_insert(mounted.root_fh);
            tcp.push(Arc::clone(&mounted.transport));
            connections.push(Connection {
                transport: mounted.transport,
                service: Some(mounted.service),
            });
        }

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            // nconnect >= 1, so the first mount filled this in
            root_fh: root_fh.unwrap_or_else(|| unreachable!("no connections opened")),
            tcp,
        })
    }

    /// Build a pool over externally-constructed transports. Used by the
    /// test suite to drive the client without a server.
    pub fn from_transports(transports: Vec<Arc<dyn NfsTransport>>, root_fh: Fh3) -> Self {
        assert!(!transports.is_empty());
        Self {
            connections: transports
                .into_iter()
                .map(|transport| Connection {
                    transport,
                    service: None,
                })
                .collect(),
            next: AtomicUsize::new(0),
            root_fh,
            tcp: Vec::new(),
        }
    }

    /// Root file handle of the mounted export.
    pub fn root_fh(&self) -> &Fh3 {
        &self.root_fh
    }

    /// Number of connections, healthy or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Pick a context for the next call: round-robin over healthy
    /// connections, falling back to plain round-robin if none are healthy
    /// (the submit path will then surface the failure).
    pub fn get_context(&self) -> &Arc<dyn NfsTransport> {
        let n = self.connections.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let conn = &self.connections[(start + i) % n];
            if conn.transport.healthy() {
                return &conn.transport;
            }
        }
        warn!("no healthy rpc connections, using round-robin fallback");
        &self.connections[start % n].transport
    }

    /// Close every connection and join the service threads.
    pub fn stop(&mut self) {
        for t in &self.tcp {
            t.close();
        }
        for conn in &mut self.connections {
            if let Some(handle) = conn.service.take() {
                if handle.join().is_err() {
                    warn!("rpc service thread panicked during shutdown");
                }
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop();
    }
}
