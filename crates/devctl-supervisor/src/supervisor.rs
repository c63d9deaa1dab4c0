use crate::{
    control_uds::{ControlEndpoint, ControlHandler},
    opener::UrlOpener,
    peers::{self, PeerInfo, DEFAULT_PEER_TIMEOUT},
    service::{Listenable, RunningService},
};
use devctl_core::{
    control_proto::{ControlCommand, InfoSnapshot, REPLY_OK},
    ports::{self, PortError},
    Identity,
};
use std::{
    collections::BTreeMap,
    future::Future,
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_TAKEOVER_TIMEOUT: Duration = Duration::from_secs(3);
const TAKEOVER_POLL: Duration = Duration::from_millis(50);
const REQUEST_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub identity: Identity,
    pub control_dir: PathBuf,
    pub peer_timeout: Duration,
    pub takeover_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(identity: Identity, control_dir: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            control_dir: control_dir.into(),
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            takeover_timeout: DEFAULT_TAKEOVER_TIMEOUT,
        }
    }

    pub fn endpoint(&self) -> ControlEndpoint {
        ControlEndpoint::new(self.control_dir.clone(), &self.identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Listening,
    Restarting,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("service has not been started")]
    NotStarted,
    #[error("supervisor has stopped")]
    Stopped,
}

impl SupervisorError {
    pub fn is_port_exhaustion(&self) -> bool {
        matches!(self, SupervisorError::Port(err) if err.is_exhausted())
    }
}

/// Owns the one live [`RunningService`] for an identity.
pub struct ServerSupervisor<S> {
    config: SupervisorConfig,
    service: S,
    current: Option<RunningService>,
    preferred_port: Option<u16>,
    state: SupervisorState,
    terminated: bool,
    snapshot: watch::Sender<InfoSnapshot>,
}

impl<S: Listenable> ServerSupervisor<S> {
    pub fn new(config: SupervisorConfig, service: S) -> Self {
        let (snapshot, _) = watch::channel(InfoSnapshot {
            id: config.identity.id.clone(),
            name: config.identity.name.clone(),
            port: None,
            url: None,
        });
        Self {
            config,
            service,
            current: None,
            preferred_port: None,
            state: SupervisorState::Idle,
            terminated: false,
            snapshot,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn current_port(&self) -> Option<u16> {
        self.current.as_ref().map(RunningService::port)
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current.as_ref().map(RunningService::url)
    }

    pub fn snapshot(&self) -> watch::Receiver<InfoSnapshot> {
        self.snapshot.subscribe()
    }

    /// Binds the service on the first usable port from `base_port`.
    ///
    /// With `allow_restart_existing`, a live instance of the same identity sitting on the
    /// candidate ports is asked to stop first so it can be replaced instead of duplicated.
    pub async fn start(
        &mut self,
        base_port: u16,
        allow_restart_existing: bool,
    ) -> Result<String, SupervisorError> {
        if self.terminated {
            return Err(SupervisorError::Stopped);
        }
        if let Some(previous) = self.current.take() {
            previous.stop().await;
        }
        self.state = SupervisorState::Starting;
        self.preferred_port = Some(base_port);

        let endpoint = self.config.endpoint();
        let exclude = (!allow_restart_existing).then_some(endpoint.socket_path.as_path());
        let mut peers =
            peers::discover(&self.config.control_dir, exclude, self.config.peer_timeout).await;

        if allow_restart_existing {
            if let Some(peer) = same_identity_peer(&peers, &self.config.identity) {
                self.evict(&peer).await;
                peers =
                    peers::discover(&self.config.control_dir, None, self.config.peer_timeout)
                        .await;
            }
        }

        let identity = &self.config.identity;
        let service = &self.service;
        let allocated = ports::allocate(base_port, |port| {
            if let Some(peer) = peers.get(&port) {
                if peer.id == identity.id {
                    info!(event = "port_held_by_same_identity", port, peer = %peer.id);
                } else {
                    warn!(event = "peer_port_skipped", port, peer = %peer.id, name = %peer.name);
                }
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("port {port} is used by {}", peer.id),
                ));
            }
            service.listen(port)
        });

        match allocated {
            Ok(running) => {
                let url = running.url().to_string();
                info!(
                    event = "service_listening",
                    id = %self.config.identity.id,
                    port = running.port(),
                    url = %url
                );
                self.preferred_port = Some(running.port());
                self.publish(Some(running.port()), Some(url.clone()));
                self.current = Some(running);
                self.state = SupervisorState::Listening;
                Ok(url)
            }
            Err(err) => {
                error!(event = "service_start_failed", base_port, error = %err);
                self.publish(None, None);
                self.state = SupervisorState::Stopped;
                Err(err.into())
            }
        }
    }

    /// Retires the current service, then binds again preferring the port it held.
    pub async fn restart(&mut self) -> Result<String, SupervisorError> {
        if self.terminated {
            return Err(SupervisorError::Stopped);
        }
        let preferred = self
            .current_port()
            .or(self.preferred_port)
            .ok_or(SupervisorError::NotStarted)?;

        self.state = SupervisorState::Restarting;
        info!(event = "service_restart", port = preferred);
        if let Some(current) = self.current.take() {
            current.stop().await;
        }
        self.publish(None, None);
        self.start(preferred, false).await
    }

    /// Terminal transition; later `start`/`restart` calls fail with [`SupervisorError::Stopped`].
    pub async fn stop(&mut self) {
        if self.terminated {
            return;
        }
        self.state = SupervisorState::Stopping;
        if let Some(current) = self.current.take() {
            info!(event = "service_stop", port = current.port());
            current.stop().await;
        }
        self.publish(None, None);
        self.state = SupervisorState::Stopped;
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Moves the supervisor onto its own task. All state changes go through the returned handle.
    pub fn spawn(self, opener: Arc<dyn UrlOpener>) -> (SupervisorHandle, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let (terminated_tx, terminated) = watch::channel(self.terminated);
        let handle = SupervisorHandle {
            requests,
            snapshot: self.snapshot(),
            terminated,
        };
        let task = tokio::spawn(run_actor(self, rx, opener, terminated_tx));
        (handle, task)
    }

    async fn evict(&self, peer: &PeerInfo) {
        info!(event = "peer_takeover", peer = %peer.id, port = ?peer.port);
        match peers::send_command(
            &peer.socket,
            ControlCommand::Stop.as_str(),
            self.config.peer_timeout,
        )
        .await
        {
            Some(reply) if reply == REPLY_OK => {}
            Some(reply) => warn!(event = "peer_takeover_refused", peer = %peer.id, reply = %reply),
            None => warn!(event = "peer_takeover_no_reply", peer = %peer.id),
        }

        let deadline = Instant::now() + self.config.takeover_timeout;
        while peer.socket.exists() {
            if Instant::now() >= deadline {
                warn!(event = "peer_takeover_slow", peer = %peer.id);
                break;
            }
            tokio::time::sleep(TAKEOVER_POLL).await;
        }
    }

    fn publish(&self, port: Option<u16>, url: Option<String>) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.port = port;
            snapshot.url = url;
        });
    }
}

/// Live peer answering for `identity`, wherever it landed.
///
/// Ports held by processes without a control socket never show up in the map, so the match is
/// by id rather than by walking candidate ports. A same-identity peer also owns the socket path
/// this instance is about to bind, which makes it a takeover target on any port.
fn same_identity_peer(peers: &BTreeMap<u16, PeerInfo>, identity: &Identity) -> Option<PeerInfo> {
    peers.values().find(|peer| peer.id == identity.id).cloned()
}

enum SupervisorRequest {
    Restart(oneshot::Sender<Result<String, SupervisorError>>),
    Stop(oneshot::Sender<()>),
    Open,
}

async fn run_actor<S: Listenable>(
    mut supervisor: ServerSupervisor<S>,
    mut requests: mpsc::Receiver<SupervisorRequest>,
    opener: Arc<dyn UrlOpener>,
    terminated: watch::Sender<bool>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            SupervisorRequest::Restart(reply) => {
                let result = supervisor.restart().await;
                if let Err(err) = &result {
                    warn!(event = "restart_failed", error = %err);
                }
                let _ = reply.send(result);
            }
            SupervisorRequest::Stop(reply) => {
                supervisor.stop().await;
                terminated.send_replace(true);
                let _ = reply.send(());
                break;
            }
            SupervisorRequest::Open => match supervisor.current_url() {
                Some(url) => opener.open(url),
                None => debug!(event = "open_without_service"),
            },
        }
    }

    if !supervisor.is_terminated() {
        supervisor.stop().await;
    }
    terminated.send_replace(true);
}

/// Cloneable front door to a spawned [`ServerSupervisor`].
///
/// Requests are processed one at a time in arrival order, so a restart that arrives while
/// another is in flight waits for it instead of interleaving.
#[derive(Clone)]
pub struct SupervisorHandle {
    requests: mpsc::Sender<SupervisorRequest>,
    snapshot: watch::Receiver<InfoSnapshot>,
    terminated: watch::Receiver<bool>,
}

impl SupervisorHandle {
    pub async fn request_restart(&self) -> Result<String, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(SupervisorRequest::Restart(tx))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    pub async fn request_stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(SupervisorRequest::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn request_open(&self) {
        if self.requests.try_send(SupervisorRequest::Open).is_err() {
            debug!(event = "open_request_dropped");
        }
    }

    pub fn snapshot(&self) -> InfoSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Resolves once the supervisor has reached its terminal state.
    pub async fn terminated(&self) {
        let mut rx = self.terminated.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ControlHandler for SupervisorHandle {
    fn restart(&self) -> impl Future<Output = anyhow::Result<String>> + Send {
        async move { Ok(self.request_restart().await?) }
    }

    fn stop(&self) -> impl Future<Output = ()> + Send {
        self.request_stop()
    }

    fn info(&self) -> InfoSnapshot {
        self.snapshot()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::service::{bind_tcp, http_url};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Clone, Default)]
    struct CountingService {
        binds: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
    }

    impl Listenable for CountingService {
        fn listen(&self, port: u16) -> io::Result<RunningService> {
            let listener = tokio::net::TcpListener::from_std(bind_tcp("127.0.0.1", port)?)?;
            self.binds.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);

            let (tx, rx) = oneshot::channel::<()>();
            let live_counter = self.live.clone();
            let task = tokio::spawn(async move {
                tokio::select! {
                    _ = rx => {}
                    _ = async { loop { let _ = listener.accept().await; } } => {}
                }
                drop(listener);
                live_counter.fetch_sub(1, Ordering::SeqCst);
            });
            Ok(RunningService::new(port, http_url("127.0.0.1", port), tx, task))
        }
    }

    struct NoopOpener;

    impl UrlOpener for NoopOpener {
        fn open(&self, _url: &str) {}
    }

    fn test_config(name: &str) -> SupervisorConfig {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("devctl-sup-{name}-{nanos}"));
        let mut config = SupervisorConfig::new(Identity::new("app", &dir.to_string_lossy()), dir);
        config.peer_timeout = Duration::from_millis(300);
        config
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .expect("free port")
    }

    fn port_is_free(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    #[tokio::test]
    async fn start_binds_base_port_and_publishes_snapshot() {
        let port = free_port();
        let mut supervisor = ServerSupervisor::new(test_config("start"), CountingService::default());
        let snapshot = supervisor.snapshot();

        let url = supervisor.start(port, true).await.expect("start");
        assert_eq!(url, format!("http://localhost:{port}"));
        assert_eq!(supervisor.state(), SupervisorState::Listening);
        assert_eq!(snapshot.borrow().port, Some(port));
        assert_eq!(snapshot.borrow().url.as_deref(), Some(url.as_str()));

        supervisor.stop().await;
        assert!(port_is_free(port));
        assert_eq!(snapshot.borrow().port, None);
    }

    #[tokio::test]
    async fn occupied_port_moves_to_next() {
        let blocker = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("blocker");
        let taken = blocker.local_addr().expect("addr").port();
        let mut supervisor = ServerSupervisor::new(test_config("occupied"), CountingService::default());

        supervisor.start(taken, true).await.expect("start");
        let bound = supervisor.current_port().expect("bound");
        assert!(bound > taken);
        supervisor.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn foreign_peer_port_is_skipped_even_if_bindable() {
        use crate::control_uds::{ControlChannel, ControlEndpoint};

        struct ForeignPeer(u16);
        impl ControlHandler for ForeignPeer {
            fn restart(&self) -> impl Future<Output = anyhow::Result<String>> + Send {
                async move { Ok(String::new()) }
            }
            fn stop(&self) -> impl Future<Output = ()> + Send {
                async move {}
            }
            fn info(&self) -> InfoSnapshot {
                InfoSnapshot {
                    id: "other-123456".to_string(),
                    name: "other".to_string(),
                    port: Some(self.0),
                    url: None,
                }
            }
        }

        let config = test_config("foreign");
        let port = free_port();
        let endpoint = ControlEndpoint::new(
            config.control_dir.clone(),
            &Identity::new("other", "elsewhere"),
        );
        let mut channel = ControlChannel::open(endpoint, Arc::new(ForeignPeer(port)))
            .await
            .expect("open foreign");

        let mut supervisor = ServerSupervisor::new(config, CountingService::default());
        supervisor.start(port, true).await.expect("start");
        assert_ne!(supervisor.current_port(), Some(port));

        supervisor.stop().await;
        channel.close().await;
    }

    #[tokio::test]
    async fn restart_reuses_port_and_never_overlaps() {
        let port = free_port();
        let service = CountingService::default();
        let mut supervisor = ServerSupervisor::new(test_config("restart"), service.clone());

        let first = supervisor.start(port, true).await.expect("start");
        let second = supervisor.restart().await.expect("restart");
        assert_eq!(first, second);
        assert_eq!(service.binds.load(Ordering::SeqCst), 2);
        assert_eq!(service.max_live.load(Ordering::SeqCst), 1);

        supervisor.stop().await;
        assert!(matches!(
            supervisor.restart().await,
            Err(SupervisorError::Stopped)
        ));
    }

    struct FullService;

    impl Listenable for FullService {
        fn listen(&self, port: u16) -> io::Result<RunningService> {
            Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{port} taken")))
        }
    }

    #[tokio::test]
    async fn exhausted_range_is_reported_as_port_exhaustion() {
        let config = test_config("exhausted");
        assert_eq!(config.endpoint().directory, config.control_dir);
        let mut supervisor = ServerSupervisor::new(config, FullService);
        assert_eq!(supervisor.config().takeover_timeout, DEFAULT_TAKEOVER_TIMEOUT);

        let err = supervisor.start(65530, true).await.expect_err("no port left");
        assert!(err.is_port_exhaustion());
        assert!(err.to_string().contains("65530"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!SupervisorError::NotStarted.is_port_exhaustion());
    }

    #[tokio::test]
    async fn restart_before_start_is_rejected() {
        let mut supervisor = ServerSupervisor::new(test_config("unstarted"), CountingService::default());
        assert!(matches!(
            supervisor.restart().await,
            Err(SupervisorError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn concurrent_restarts_through_handle_are_serialized() {
        let port = free_port();
        let service = CountingService::default();
        let mut supervisor = ServerSupervisor::new(test_config("serial"), service.clone());
        supervisor.start(port, true).await.expect("start");
        let (handle, task) = supervisor.spawn(Arc::new(NoopOpener));

        let (a, b) = tokio::join!(handle.request_restart(), handle.request_restart());
        assert_eq!(a.expect("first restart"), format!("http://localhost:{port}"));
        assert_eq!(b.expect("second restart"), format!("http://localhost:{port}"));
        assert_eq!(service.binds.load(Ordering::SeqCst), 3);
        assert_eq!(service.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(handle.snapshot().port, Some(port));

        handle.request_stop().await;
        handle.terminated().await;
        assert!(handle.is_terminated());
        task.await.expect("actor exits");
        assert!(port_is_free(port));
        assert!(matches!(
            handle.request_restart().await,
            Err(SupervisorError::Stopped)
        ));
    }

    #[test]
    fn same_identity_peer_is_found_past_unrelated_ports() {
        let me = Identity::new("app", "/srv/app");
        let peer = |id: &str, port: u16| PeerInfo {
            id: id.to_string(),
            name: "x".to_string(),
            port: Some(port),
            url: None,
            socket: PathBuf::from(format!("/tmp/{id}.sock")),
        };
        let mut peers = BTreeMap::new();
        peers.insert(3000, peer("other-111111", 3000));
        peers.insert(3005, peer(&me.id, 3005));

        assert_eq!(
            same_identity_peer(&peers, &me).and_then(|p| p.port),
            Some(3005)
        );
        peers.remove(&3005);
        assert!(same_identity_peer(&peers, &me).is_none());
    }
}
