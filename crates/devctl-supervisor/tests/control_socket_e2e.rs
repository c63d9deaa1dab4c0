#![cfg(unix)]

use devctl_core::{control_proto, Identity};
use devctl_supervisor::{
    peers::{self, send_command},
    service::{bind_tcp, http_url},
    ControlChannel, Listenable, RunningService, ServerSupervisor, SupervisorConfig,
    SupervisorHandle, UrlOpener,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn test_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("devctl-e2e-{name}-{}-{nanos}", std::process::id()))
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

async fn wait_until<F: FnMut() -> bool>(mut check: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Accepts and drops TCP connections; counts how many listeners are alive at once.
#[derive(Clone, Default)]
struct TcpService {
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl Listenable for TcpService {
    fn listen(&self, port: u16) -> io::Result<RunningService> {
        let listener = tokio::net::TcpListener::from_std(bind_tcp("127.0.0.1", port)?)?;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        let counter = self.live.clone();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = rx => {}
                _ = async { loop { let _ = listener.accept().await; } } => {}
            }
            drop(listener);
            counter.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(RunningService::new(port, http_url("127.0.0.1", port), tx, task))
    }
}

struct NoopOpener;

impl UrlOpener for NoopOpener {
    fn open(&self, _url: &str) {}
}

struct Instance {
    handle: SupervisorHandle,
    socket: PathBuf,
    service: TcpService,
    closer: JoinHandle<()>,
}

impl Instance {
    async fn launch(dir: &Path, identity: Identity, port: u16) -> Self {
        let mut config = SupervisorConfig::new(identity, dir);
        config.peer_timeout = Duration::from_millis(500);
        let service = TcpService::default();
        let mut supervisor = ServerSupervisor::new(config.clone(), service.clone());
        supervisor.start(port, true).await.expect("start");

        let (handle, _task) = supervisor.spawn(Arc::new(NoopOpener));
        let mut channel = ControlChannel::open(config.endpoint(), Arc::new(handle.clone()))
            .await
            .expect("open control channel");
        let socket = channel.socket_path().to_path_buf();
        let watcher = handle.clone();
        let closer = tokio::spawn(async move {
            watcher.terminated().await;
            channel.close().await;
        });
        Self {
            handle,
            socket,
            service,
            closer,
        }
    }

    async fn shutdown(self) {
        self.handle.request_stop().await;
        let _ = timeout(Duration::from_secs(3), self.closer).await;
    }
}

async fn ask(socket: &Path, command: &str) -> String {
    send_command(socket, command, Duration::from_secs(5))
        .await
        .unwrap_or_else(|| panic!("no reply to {command}"))
}

#[tokio::test]
async fn restart_reply_points_at_a_reachable_port() {
    let dir = test_dir("restart");
    let port = free_port();
    let instance = Instance::launch(&dir, Identity::new("app", "restart-e2e"), port).await;

    let reply = ask(&instance.socket, "restart").await;
    let url = reply.strip_prefix("ok:").expect("ok reply");
    let new_port: u16 = url
        .rsplit(':')
        .next()
        .and_then(|raw| raw.parse().ok())
        .expect("port in url");
    tokio::net::TcpStream::connect(("127.0.0.1", new_port))
        .await
        .expect("restarted port accepts connections");
    if new_port != port {
        assert!(port_is_free(port));
    }
    assert_eq!(instance.service.live.load(Ordering::SeqCst), 1);
    assert_eq!(instance.service.max_live.load(Ordering::SeqCst), 1);

    let info = control_proto::decode_info(&ask(&instance.socket, "info").await).expect("info");
    assert_eq!(info.port, Some(new_port));
    assert_eq!(info.url.as_deref(), Some(url));
    assert_eq!(
        ask(&instance.socket, "bogus").await,
        "error:unknown-command"
    );

    instance.shutdown().await;
}

#[tokio::test]
async fn stop_replies_ok_and_frees_the_port() {
    let dir = test_dir("stop");
    let port = free_port();
    let instance = Instance::launch(&dir, Identity::new("app", "stop-e2e"), port).await;
    assert!(!port_is_free(port));

    assert_eq!(ask(&instance.socket, "stop").await, "ok");
    timeout(Duration::from_secs(3), instance.handle.terminated())
        .await
        .expect("supervisor terminates");
    assert!(wait_until(|| port_is_free(port), Duration::from_secs(3)).await);

    let socket = instance.socket.clone();
    timeout(Duration::from_secs(3), instance.closer)
        .await
        .expect("control channel closes")
        .expect("closer task");
    assert!(!socket.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_identity_start_replaces_the_running_instance() {
    let dir = test_dir("takeover");
    let identity = Identity::new("app", "takeover-e2e");
    let port = free_port();

    let first = Instance::launch(&dir, identity.clone(), port).await;
    assert_eq!(first.handle.snapshot().port, Some(port));

    let second = Instance::launch(&dir, identity.clone(), port).await;
    timeout(Duration::from_secs(3), first.handle.terminated())
        .await
        .expect("first instance was stopped");
    assert_eq!(second.handle.snapshot().port, Some(port));

    let found = peers::discover(&dir, None, Duration::from_secs(1)).await;
    let same = found
        .values()
        .filter(|peer| peer.id == identity.id)
        .collect::<Vec<_>>();
    assert_eq!(same.len(), 1);
    assert_eq!(same[0].port, Some(port));

    second.shutdown().await;
}

#[tokio::test]
async fn foreign_instance_keeps_its_port() {
    let dir = test_dir("foreign");
    let port = free_port();
    let web = Instance::launch(&dir, Identity::new("web", "foreign-web"), port).await;
    let api = Instance::launch(&dir, Identity::new("api", "foreign-api"), port).await;

    assert!(!web.handle.is_terminated());
    assert_eq!(web.handle.snapshot().port, Some(port));
    let api_port = api.handle.snapshot().port.expect("api bound");
    assert_ne!(api_port, port);

    let found = peers::discover(&dir, None, Duration::from_secs(1)).await;
    assert_eq!(found.len(), 2);
    assert_eq!(found.get(&port).map(|peer| peer.name.as_str()), Some("web"));

    api.shutdown().await;
    web.shutdown().await;
}

fn same_identity_ports(found: &std::collections::BTreeMap<u16, peers::PeerInfo>, id: &str) -> Vec<u16> {
    found
        .values()
        .filter(|peer| peer.id == id)
        .filter_map(|peer| peer.port)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn takeover_reaches_an_instance_above_a_plainly_occupied_base_port() {
    let dir = test_dir("takeover-above");
    let identity = Identity::new("app", "takeover-above-e2e");
    let blocker = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("blocker");
    let base = blocker.local_addr().expect("blocker addr").port();

    let first = Instance::launch(&dir, identity.clone(), base).await;
    let first_port = first.handle.snapshot().port.expect("first bound");
    assert!(first_port > base);

    let second = Instance::launch(&dir, identity.clone(), base).await;
    timeout(Duration::from_secs(3), first.handle.terminated())
        .await
        .expect("first instance was stopped");
    let second_port = second.handle.snapshot().port.expect("second bound");
    assert_ne!(second_port, base);

    let found = peers::discover(&dir, None, Duration::from_secs(1)).await;
    assert_eq!(same_identity_ports(&found, &identity.id), vec![second_port]);

    second.shutdown().await;
    drop(blocker);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn takeover_passes_a_foreign_peer_between_base_and_instance() {
    let dir = test_dir("takeover-foreign");
    let identity = Identity::new("app", "takeover-foreign-e2e");
    let blocker = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("blocker");
    let base = blocker.local_addr().expect("blocker addr").port();

    let web = Instance::launch(&dir, Identity::new("web", "takeover-foreign-web"), base).await;
    let web_port = web.handle.snapshot().port.expect("web bound");
    let first = Instance::launch(&dir, identity.clone(), base).await;
    let first_port = first.handle.snapshot().port.expect("first bound");
    assert!(base < web_port && web_port < first_port);

    let second = Instance::launch(&dir, identity.clone(), base).await;
    timeout(Duration::from_secs(3), first.handle.terminated())
        .await
        .expect("first instance was stopped");
    assert!(!web.handle.is_terminated());
    assert_eq!(web.handle.snapshot().port, Some(web_port));
    let second_port = second.handle.snapshot().port.expect("second bound");
    assert!(second_port != base && second_port != web_port);

    let found = peers::discover(&dir, None, Duration::from_secs(1)).await;
    assert_eq!(same_identity_ports(&found, &identity.id), vec![second_port]);
    assert_eq!(found.get(&web_port).map(|peer| peer.name.as_str()), Some("web"));

    second.shutdown().await;
    web.shutdown().await;
    drop(blocker);
}
