use crate::{
    console::LineSink,
    control_uds::{ControlEndpoint, ControlHandler},
    opener::UrlOpener,
    peers::{self, PeerProbe, DEFAULT_PEER_TIMEOUT},
    workspaces::Workspace,
};
use devctl_core::{
    control_proto::{ControlCommand, InfoSnapshot},
    identity, Identity,
};
use regex::Regex;
use std::{
    collections::HashMap,
    future::Future,
    process::{ExitStatus, Stdio},
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub const SET_NAME: &str = "workspaces";
const TERM_GRACE: Duration = Duration::from_secs(3);
const READER_DRAIN: Duration = Duration::from_millis(500);
const REQUEST_QUEUE: usize = 16;

/// Control identity for a workspace set. Order and duplicates in `workspaces` do not matter.
pub fn set_identity(workspaces: &[Workspace]) -> Identity {
    let dirs = workspaces
        .iter()
        .map(|workspace| workspace.dir.as_path())
        .collect::<Vec<_>>();
    identity::resolve_for_set(SET_NAME, &dirs)
}

/// Hands the request to an orchestrator already serving the same workspace set.
///
/// Returns the restart reply when a live owner answered `info` on `endpoint`, `None` when the
/// caller should start the workspaces itself.
pub async fn restart_existing(endpoint: &ControlEndpoint, restart_timeout: Duration) -> Option<String> {
    let PeerProbe::Responsive(owner) =
        peers::probe(endpoint.socket_path.clone(), DEFAULT_PEER_TIMEOUT).await
    else {
        return None;
    };
    info!(event = "workspaces_forward_restart", owner = %owner.id);
    peers::send_command(
        &endpoint.socket_path,
        ControlCommand::Restart.as_str(),
        restart_timeout,
    )
    .await
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid regex")
    })
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"https?://[^\s'"<>`\[\]{}]+"#).expect("valid regex"))
}

/// First http(s) URL in a line of child output, ignoring terminal colour codes.
pub fn extract_url(line: &str) -> Option<String> {
    let clean = ansi_pattern().replace_all(line, "");
    let found = url_pattern().find(&clean)?;
    let url = found
        .as_str()
        .trim_end_matches(|ch: char| matches!(ch, '.' | ',' | ';' | ':' | '!' | '?' | ')'));
    let host = url.split_once("://").map(|(_, rest)| rest).unwrap_or_default();
    if host.is_empty() {
        return None;
    }
    Some(url.to_string())
}

#[derive(Debug)]
enum ChildEvent {
    Url { workspace: String, url: String },
}

struct RunningChild {
    name: String,
    kill: Option<oneshot::Sender<()>>,
    done: JoinHandle<()>,
}

/// Runs one child process per workspace and treats the whole set as a single unit.
pub struct WorkspaceOrchestrator {
    identity: Identity,
    workspaces: Vec<Workspace>,
    sink: Arc<dyn LineSink>,
    children: Vec<RunningChild>,
    latest_urls: HashMap<String, String>,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
    events: mpsc::UnboundedReceiver<ChildEvent>,
    snapshot: watch::Sender<InfoSnapshot>,
    terminated: bool,
}

impl WorkspaceOrchestrator {
    pub fn new(workspaces: Vec<Workspace>, sink: Arc<dyn LineSink>) -> Self {
        let identity = set_identity(&workspaces);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(InfoSnapshot {
            id: identity.id.clone(),
            name: identity.name.clone(),
            port: None,
            url: None,
        });
        Self {
            identity,
            workspaces,
            sink,
            children: Vec::new(),
            latest_urls: HashMap::new(),
            events_tx,
            events,
            snapshot,
            terminated: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn workspaces(&self) -> &[Workspace] {
        &self.workspaces
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }

    pub fn latest_url(&self, workspace: &str) -> Option<&str> {
        self.latest_urls.get(workspace).map(String::as_str)
    }

    /// First known URL in workspace order.
    pub fn first_url(&self) -> Option<&str> {
        self.workspaces
            .iter()
            .find_map(|workspace| self.latest_url(&workspace.name))
    }

    /// Known URLs in workspace order.
    pub fn urls(&self) -> Vec<(String, String)> {
        self.workspaces
            .iter()
            .filter_map(|workspace| {
                self.latest_url(&workspace.name)
                    .map(|url| (workspace.name.clone(), url.to_string()))
            })
            .collect()
    }

    pub fn start_all(&mut self) {
        if !self.children.is_empty() {
            debug!(event = "start_all_skipped", running = self.children.len());
            return;
        }
        for workspace in self.workspaces.clone() {
            if let Some(child) = self.spawn_child(&workspace) {
                self.children.push(child);
            }
        }
    }

    /// Signals every child, then waits for each to exit.
    pub async fn stop_all(&mut self) {
        let mut children = std::mem::take(&mut self.children);
        for child in &mut children {
            if let Some(kill) = child.kill.take() {
                let _ = kill.send(());
            }
        }
        for child in children {
            if let Err(err) = child.done.await {
                warn!(event = "child_join_error", workspace = %child.name, error = %err);
            }
        }
    }

    /// All-or-nothing: no child is started again until every old one has exited.
    pub async fn restart_all(&mut self) -> String {
        info!(event = "workspaces_restart", id = %self.identity.id);
        self.stop_all().await;
        self.start_all();
        self.first_url().unwrap_or_default().to_string()
    }

    pub async fn stop(&mut self) {
        if self.terminated {
            return;
        }
        self.stop_all().await;
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn open(&self, opener: &dyn UrlOpener) {
        match self.first_url() {
            Some(url) => opener.open(url),
            None => self.sink.line("no URL detected yet"),
        }
    }

    pub fn snapshot(&self) -> watch::Receiver<InfoSnapshot> {
        self.snapshot.subscribe()
    }

    /// Applies everything the output readers have reported so far.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Url { workspace, url } => {
                if self.latest_urls.get(&workspace) == Some(&url) {
                    return;
                }
                info!(event = "workspace_url", workspace = %workspace, url = %url);
                self.latest_urls.insert(workspace, url);
                let first = self.first_url().map(str::to_string);
                self.snapshot.send_modify(|snapshot| snapshot.url = first);
            }
        }
    }

    fn spawn_child(&self, workspace: &Workspace) -> Option<RunningChild> {
        let Some((program, args)) = workspace.command.split_first() else {
            self.sink
                .line(&format!("[{}] failed to start: empty command", workspace.name));
            return None;
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&workspace.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(event = "child_spawn_failed", workspace = %workspace.name, error = %err);
                self.sink.line(&format!(
                    "[{}] failed to start `{}`: {err}",
                    workspace.name,
                    workspace.command_line()
                ));
                return None;
            }
        };
        info!(
            event = "child_spawned",
            workspace = %workspace.name,
            pid = ?child.id(),
            dir = %workspace.dir.display()
        );

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                workspace.name.clone(),
                self.sink.clone(),
                self.events_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                workspace.name.clone(),
                self.sink.clone(),
                self.events_tx.clone(),
            )));
        }

        let (kill, kill_rx) = oneshot::channel();
        let done = tokio::spawn(supervise_child(
            child,
            workspace.name.clone(),
            kill_rx,
            readers,
            self.sink.clone(),
        ));
        Some(RunningChild {
            name: workspace.name.clone(),
            kill: Some(kill),
            done,
        })
    }

    /// Moves the orchestrator onto its own task, mirroring [`crate::supervisor::ServerSupervisor::spawn`].
    pub fn spawn(self, opener: Arc<dyn UrlOpener>) -> (OrchestratorHandle, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let (terminated_tx, terminated) = watch::channel(self.terminated);
        let handle = OrchestratorHandle {
            requests,
            snapshot: self.snapshot(),
            terminated,
        };
        let task = tokio::spawn(run_actor(self, rx, opener, terminated_tx));
        (handle, task)
    }
}

async fn forward_lines<R>(
    reader: R,
    workspace: String,
    sink: Arc<dyn LineSink>,
    events: mpsc::UnboundedSender<ChildEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                sink.line(&format!("[{workspace}] {line}"));
                if let Some(url) = extract_url(&line) {
                    let _ = events.send(ChildEvent::Url {
                        workspace: workspace.clone(),
                        url,
                    });
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(event = "child_read_error", workspace = %workspace, error = %err);
                break;
            }
        }
    }
}

async fn supervise_child(
    mut child: Child,
    workspace: String,
    kill: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    sink: Arc<dyn LineSink>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill => (terminate(&mut child, &workspace).await, true),
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    match status {
        Ok(status) if requested => {
            debug!(event = "child_stopped", workspace = %workspace, status = %status);
        }
        Ok(status) => {
            info!(event = "child_exited", workspace = %workspace, status = %status);
            sink.line(&format!("[{workspace}] {}", describe_exit(status)));
        }
        Err(err) => {
            warn!(event = "child_wait_failed", workspace = %workspace, error = %err);
            sink.line(&format!("[{workspace}] lost track of process: {err}"));
        }
    }
}

/// TERM to the whole process group, then KILL once the grace period runs out.
async fn terminate(child: &mut Child, workspace: &str) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group("-TERM", pid);
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(status) => {
                    signal_group("-KILL", pid);
                    return status;
                }
                Err(_) => {
                    warn!(event = "child_term_timeout", workspace, pid);
                    signal_group("-KILL", pid);
                }
            }
        }
    }
    #[cfg(not(unix))]
    debug!(event = "child_kill", workspace);
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn signal_group(signal: &str, pid: u32) {
    let outcome = std::process::Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = outcome {
        debug!(event = "signal_group_failed", signal, pid, error = %err);
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(0) => "exited".to_string(),
        Some(code) => format!("exited with code {code}"),
        None => format!("terminated ({status})"),
    }
}

enum OrchestratorRequest {
    Restart(oneshot::Sender<String>),
    Stop(oneshot::Sender<()>),
    Open,
    Urls(oneshot::Sender<Vec<(String, String)>>),
}

async fn run_actor(
    mut orchestrator: WorkspaceOrchestrator,
    mut requests: mpsc::Receiver<OrchestratorRequest>,
    opener: Arc<dyn UrlOpener>,
    terminated: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            event = orchestrator.events.recv() => {
                if let Some(event) = event {
                    orchestrator.apply(event);
                }
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                orchestrator.drain_events();
                match request {
                    OrchestratorRequest::Restart(reply) => {
                        let url = orchestrator.restart_all().await;
                        let _ = reply.send(url);
                    }
                    OrchestratorRequest::Stop(reply) => {
                        orchestrator.stop().await;
                        terminated.send_replace(true);
                        let _ = reply.send(());
                        break;
                    }
                    OrchestratorRequest::Open => orchestrator.open(opener.as_ref()),
                    OrchestratorRequest::Urls(reply) => {
                        let _ = reply.send(orchestrator.urls());
                    }
                }
            }
        }
    }

    orchestrator.stop().await;
    terminated.send_replace(true);
}

/// Cloneable front door to a spawned [`WorkspaceOrchestrator`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    requests: mpsc::Sender<OrchestratorRequest>,
    snapshot: watch::Receiver<InfoSnapshot>,
    terminated: watch::Receiver<bool>,
}

impl OrchestratorHandle {
    pub async fn request_restart(&self) -> anyhow::Result<String> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(OrchestratorRequest::Restart(tx))
            .await
            .map_err(|_| anyhow::anyhow!("workspaces have stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("workspaces have stopped"))
    }

    pub async fn request_stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(OrchestratorRequest::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn request_open(&self) {
        if self.requests.try_send(OrchestratorRequest::Open).is_err() {
            debug!(event = "open_request_dropped");
        }
    }

    pub async fn urls(&self) -> Vec<(String, String)> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(OrchestratorRequest::Urls(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn snapshot(&self) -> InfoSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

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

impl ControlHandler for OrchestratorHandle {
    fn restart(&self) -> impl Future<Output = anyhow::Result<String>> + Send {
        self.request_restart()
    }

    fn stop(&self) -> impl Future<Output = ()> + Send {
        self.request_stop()
    }

    fn info(&self) -> InfoSnapshot {
        self.snapshot()
    }
}
