mod keys;
mod logging;
mod status_service;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use devctl_core::{
    control_proto::Reply,
    env_config::{process_env, resolve_base_port, resolve_control_dir},
    identity,
};
use devctl_supervisor::{
    orchestrator::{self, OrchestratorHandle},
    peers::{self, PeerProbe, DEFAULT_PEER_TIMEOUT},
    supervisor::SupervisorHandle,
    workspaces, Console, ControlChannel, ControlEndpoint, ControlHandler, LineSink,
    ServerSupervisor, SupervisorConfig, SystemBrowser, WorkspaceOrchestrator,
};
use keys::{KeyAction, KeyInput};
use status_service::StatusService;
use std::{
    future::Future,
    io::{self, IsTerminal},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "devctl", version, about = "Supervise local dev servers")]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the status page on the first free port and take control of this project.
    Serve(ServeArgs),
    /// Run the dev command of one or more workspaces as a single unit.
    Dev(DevArgs),
    /// Send one control command (restart, stop, info) and print the reply.
    Send(SendArgs),
    /// List instances answering in the control directory.
    Peers(PeersArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Skip ports held by an earlier instance of this project instead of replacing it.
    #[arg(long, default_value_t = false)]
    no_takeover: bool,
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DevArgs {
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(short = 'w', long = "workspace")]
    workspaces: Vec<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    message: String,
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PeersArgs {
    #[arg(long)]
    dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Serve(args) => serve(args, cli.debug).await,
        Command::Dev(args) => dev(args, cli.debug).await,
        Command::Send(args) => send(args).await,
        Command::Peers(args) => list_peers(args).await,
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn project_root(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("cannot determine the working directory"),
    }
}

async fn serve(args: ServeArgs, debug: bool) -> anyhow::Result<ExitCode> {
    let root = project_root(args.dir)?;
    let identity = identity::resolve(&root);
    let control_dir = resolve_control_dir(&root, process_env);
    let _log_guard = logging::init_logging(Some(&control_dir), &identity.id, debug);
    let console = Arc::new(Console::new());

    let settings = resolve_base_port(args.port, process_env);
    for message in &settings.warnings {
        console.warning(message);
    }
    info!(
        event = "serve_start",
        id = %identity.id,
        base_port = settings.base_port,
        control_dir = %control_dir.display()
    );

    let mut supervisor = ServerSupervisor::new(
        SupervisorConfig::new(identity.clone(), &control_dir),
        StatusService::new(args.host, identity.clone()),
    );
    let endpoint = supervisor.config().endpoint();
    let owner = if args.no_takeover {
        peers::live_owner(&endpoint.socket_path, DEFAULT_PEER_TIMEOUT).await
    } else {
        None
    };

    let url = match supervisor.start(settings.base_port, !args.no_takeover).await {
        Ok(url) => url,
        Err(err) if err.is_port_exhaustion() => {
            return Err(anyhow::Error::new(err).context(format!(
                "cannot start {}; pick a lower base with --port or DEVCTL_PORT",
                identity.name
            )))
        }
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("cannot start {}", identity.name)))
        }
    };
    console.line(&format!("{} listening on {url}", identity.name));

    let (handle, actor) = supervisor.spawn(Arc::new(SystemBrowser));
    let channel = match owner {
        Some(peer) => {
            warn!(event = "control_socket_owned", peer = %peer.id, port = ?peer.port);
            console.warning(&format!(
                "{} already answers on {}; running without a control socket",
                peer.id,
                endpoint.socket_path.display()
            ));
            None
        }
        None => open_control(endpoint, &handle, &console).await,
    };
    drive(handle, channel, actor, console).await;
    Ok(ExitCode::SUCCESS)
}

async fn dev(args: DevArgs, debug: bool) -> anyhow::Result<ExitCode> {
    let root = project_root(args.root)?;
    let found = workspaces::discover(&root)?;
    let selected = if !args.workspaces.is_empty() {
        workspaces::select_named(&found, &args.workspaces)?
    } else if found.len() > 1 && io::stdin().is_terminal() {
        workspaces::prompt_selection(&found, io::stdin().lock(), io::stdout())?
    } else {
        found.iter().take(1).cloned().collect()
    };
    if selected.is_empty() {
        bail!("no workspaces selected");
    }

    let identity = orchestrator::set_identity(&selected);
    let control_dir = resolve_control_dir(&root, process_env);
    let _log_guard = logging::init_logging(Some(&control_dir), &identity.id, debug);
    let console = Arc::new(Console::new());
    let endpoint = ControlEndpoint::new(&control_dir, &identity);

    if let Some(reply) = orchestrator::restart_existing(&endpoint, FORWARD_TIMEOUT).await {
        console.line(&format!("already running; restart requested ({reply})"));
        return Ok(ExitCode::SUCCESS);
    }

    let mut orchestrator = WorkspaceOrchestrator::new(selected, console.clone());
    for workspace in orchestrator.workspaces() {
        console.line(&format!(
            "[{}] {} (in {})",
            workspace.name,
            workspace.command_line(),
            workspace.dir.display()
        ));
    }
    orchestrator.start_all();

    let (handle, actor) = orchestrator.spawn(Arc::new(SystemBrowser));
    let channel = open_control(endpoint, &handle, &console).await;
    drive(handle, channel, actor, console).await;
    Ok(ExitCode::SUCCESS)
}

async fn send(args: SendArgs) -> anyhow::Result<ExitCode> {
    let socket = match args.socket {
        Some(socket) => socket,
        None => {
            let root = project_root(args.dir)?;
            let identity = identity::resolve(&root);
            resolve_control_dir(&root, process_env).join(identity.socket_file_name())
        }
    };
    let Some(reply) = peers::send_command(&socket, &args.message, SEND_TIMEOUT).await else {
        eprintln!("error: no reply from {}", socket.display());
        return Ok(ExitCode::FAILURE);
    };
    println!("{reply}");
    let failed = Reply::parse(&reply).map(|reply| reply.is_error()).unwrap_or(true);
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn list_peers(args: PeersArgs) -> anyhow::Result<ExitCode> {
    let root = project_root(args.dir)?;
    let control_dir = resolve_control_dir(&root, process_env);
    let probes = peers::probe_all(&control_dir, None, DEFAULT_PEER_TIMEOUT).await;

    if args.json {
        let rows = probes.iter().map(probe_json).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }

    if probes.is_empty() {
        println!("no instances in {}", control_dir.display());
        return Ok(ExitCode::SUCCESS);
    }
    for probe in &probes {
        match probe {
            PeerProbe::Responsive(peer) => println!(
                "{:<24} {:>5}  {}",
                peer.id,
                peer.port.map(|port| port.to_string()).unwrap_or_else(|| "-".to_string()),
                peer.url.as_deref().unwrap_or("-")
            ),
            PeerProbe::Unresponsive { reason, .. } => {
                println!("{:<24} {:>5}  ({reason})", probe.socket().display(), "-")
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn probe_json(probe: &PeerProbe) -> serde_json::Value {
    let socket = probe.socket().display().to_string();
    match probe {
        PeerProbe::Responsive(peer) => serde_json::json!({
            "status": "responsive",
            "id": peer.id,
            "name": peer.name,
            "port": peer.port,
            "url": peer.url,
            "socket": socket,
        }),
        PeerProbe::Unresponsive { reason, .. } => serde_json::json!({
            "status": "unresponsive",
            "socket": socket,
            "reason": reason,
        }),
    }
}

async fn open_control<H>(
    endpoint: ControlEndpoint,
    handle: &H,
    console: &Console,
) -> Option<ControlChannel>
where
    H: ControlHandler + Clone,
{
    match ControlChannel::open(endpoint, Arc::new(handle.clone())).await {
        Ok(channel) => {
            console.line(&format!(
                "control: printf restart | nc -U {}",
                channel.socket_path().display()
            ));
            Some(channel)
        }
        Err(err) => {
            warn!(event = "control_uds_unavailable", error = %err);
            console.warning(&format!("control socket unavailable: {err}"));
            None
        }
    }
}

/// What the key loop needs from a spawned supervised unit.
trait Supervised: ControlHandler + Clone {
    fn open_url(&self);
    fn wait_terminated(&self) -> impl Future<Output = ()> + Send;
}

impl Supervised for SupervisorHandle {
    fn open_url(&self) {
        self.request_open();
    }

    fn wait_terminated(&self) -> impl Future<Output = ()> + Send {
        self.terminated()
    }
}

impl Supervised for OrchestratorHandle {
    fn open_url(&self) {
        self.request_open();
    }

    fn wait_terminated(&self) -> impl Future<Output = ()> + Send {
        self.terminated()
    }
}

async fn drive<U: Supervised>(
    unit: U,
    channel: Option<ControlChannel>,
    actor: JoinHandle<()>,
    console: Arc<Console>,
) {
    let mut input = KeyInput::start(console.clone());
    if input.interactive() {
        console.line("keys: r restart, o open, q quit");
    }

    loop {
        tokio::select! {
            _ = unit.wait_terminated() => break,
            action = input.next() => match action {
                Some(KeyAction::Restart) => match unit.restart().await {
                    Ok(url) if url.is_empty() => console.line("restarted"),
                    Ok(url) => console.line(&format!("restarted on {url}")),
                    Err(err) => console.warning(&format!("restart failed: {err:#}")),
                },
                Some(KeyAction::Open) => unit.open_url(),
                Some(KeyAction::Stop) | None => {
                    unit.stop().await;
                    break;
                }
            },
        }
    }
    drop(input);

    if let Some(mut channel) = channel {
        channel.close().await;
    }
    if let Err(err) = actor.await {
        warn!(event = "actor_join_error", error = %err);
    }
    console.line("stopped");
}
