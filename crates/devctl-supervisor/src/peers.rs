use devctl_core::control_proto::{self, ControlCommand, InfoSnapshot};
use futures_util::future::join_all;
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

#[cfg(unix)]
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(1);
const SOCKET_EXTENSION: &str = "sock";
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// Another instance found in the control directory. Rebuilt on every scan, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub socket: PathBuf,
}

impl PeerInfo {
    fn from_snapshot(snapshot: InfoSnapshot, socket: PathBuf) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            port: snapshot.port,
            url: snapshot.url,
            socket,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerProbe {
    Responsive(PeerInfo),
    Unresponsive { socket: PathBuf, reason: String },
}

impl PeerProbe {
    pub fn socket(&self) -> &Path {
        match self {
            PeerProbe::Responsive(peer) => &peer.socket,
            PeerProbe::Unresponsive { socket, .. } => socket,
        }
    }
}

/// Sends one command and returns the first reply line.
///
/// `None` covers refused connections, timeouts and empty replies alike: callers treat the
/// peer as absent in every case.
#[cfg(unix)]
pub async fn send_command(socket: &Path, message: &str, timeout: Duration) -> Option<String> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream.write_all(message.as_bytes()).await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            reply.extend_from_slice(&chunk[..read]);
            if reply.contains(&b'\n') || reply.len() >= MAX_REPLY_BYTES {
                break;
            }
        }
        Ok::<_, io::Error>(reply)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(reply)) => {
            let text = String::from_utf8_lossy(&reply);
            let line = text.lines().next().unwrap_or_default().trim().to_string();
            if line.is_empty() {
                None
            } else {
                Some(line)
            }
        }
        Ok(Err(err)) => {
            debug!(event = "peer_send_error", socket = %socket.display(), error = %err);
            None
        }
        Err(_) => {
            debug!(event = "peer_send_timeout", socket = %socket.display(), message);
            None
        }
    }
}

#[cfg(not(unix))]
pub async fn send_command(_socket: &Path, _message: &str, _timeout: Duration) -> Option<String> {
    None
}

pub async fn probe(socket: PathBuf, timeout: Duration) -> PeerProbe {
    let Some(reply) = send_command(&socket, ControlCommand::Info.as_str(), timeout).await else {
        return PeerProbe::Unresponsive {
            socket,
            reason: "no reply".to_string(),
        };
    };
    match control_proto::decode_info(&reply) {
        Ok(snapshot) => PeerProbe::Responsive(PeerInfo::from_snapshot(snapshot, socket)),
        Err(err) => PeerProbe::Unresponsive {
            socket,
            reason: err.to_string(),
        },
    }
}

/// The instance answering on `socket`, if any. A stale file or a silent listener is not an owner.
pub async fn live_owner(socket: &Path, timeout: Duration) -> Option<PeerInfo> {
    match probe(socket.to_path_buf(), timeout).await {
        PeerProbe::Responsive(peer) => Some(peer),
        PeerProbe::Unresponsive { .. } => None,
    }
}

/// Queries every control socket in `dir` concurrently, skipping `exclude`.
pub async fn probe_all(dir: &Path, exclude: Option<&Path>, timeout: Duration) -> Vec<PeerProbe> {
    let sockets = match list_sockets(dir, exclude).await {
        Ok(sockets) => sockets,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(event = "peer_scan_error", dir = %dir.display(), error = %err);
            return Vec::new();
        }
    };
    join_all(sockets.into_iter().map(|socket| probe(socket, timeout))).await
}

/// Port to peer map for everything in `dir` that answered `info` with a port.
pub async fn discover(
    dir: &Path,
    exclude: Option<&Path>,
    timeout: Duration,
) -> BTreeMap<u16, PeerInfo> {
    build_port_map(probe_all(dir, exclude, timeout).await)
}

pub fn build_port_map(probes: Vec<PeerProbe>) -> BTreeMap<u16, PeerInfo> {
    let mut peers = BTreeMap::new();
    for probe in probes {
        match probe {
            PeerProbe::Responsive(peer) => match peer.port {
                Some(port) => {
                    if let Some(previous) = peers.insert(port, peer) {
                        debug!(event = "peer_port_shared", port, previous = %previous.id);
                    }
                }
                None => {
                    debug!(event = "peer_without_port", peer = %peer.id);
                }
            },
            PeerProbe::Unresponsive { socket, reason } => {
                debug!(event = "peer_unresponsive", socket = %socket.display(), reason = %reason);
            }
        }
    }
    peers
}

async fn list_sockets(dir: &Path, exclude: Option<&Path>) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut sockets = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SOCKET_EXTENSION) {
            continue;
        }
        if exclude.is_some_and(|skip| same_socket(skip, &path)) {
            continue;
        }
        sockets.push(path);
    }
    sockets.sort();
    Ok(sockets)
}

fn same_socket(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
