use devctl_core::{
    control_proto::{ControlCommand, InfoSnapshot, Reply, MAX_COMMAND_BYTES, UNKNOWN_COMMAND},
    Identity,
};
use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Operations a control socket can trigger on the unit it belongs to.
pub trait ControlHandler: Send + Sync + 'static {
    /// Restarts the unit and returns the URL it now serves.
    fn restart(&self) -> impl Future<Output = anyhow::Result<String>> + Send;
    /// Stops the unit. May end the process, so the reply is sent before this is called.
    fn stop(&self) -> impl Future<Output = ()> + Send;
    fn info(&self) -> InfoSnapshot;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub directory: PathBuf,
    pub socket_path: PathBuf,
}

impl ControlEndpoint {
    pub fn new(directory: impl Into<PathBuf>, identity: &Identity) -> Self {
        let directory = directory.into();
        let socket_path = directory.join(identity.socket_file_name());
        Self {
            directory,
            socket_path,
        }
    }
}

/// A bound control socket. Dropping it without [`ControlChannel::close`] leaves the file behind;
/// the next `open` on the same path removes it.
pub struct ControlChannel {
    endpoint: ControlEndpoint,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    /// `(dev, ino)` of the file this channel bound, so `close` never unlinks a successor's socket.
    bound_file: Option<(u64, u64)>,
}

impl ControlChannel {
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    pub fn socket_path(&self) -> &Path {
        &self.endpoint.socket_path
    }

    #[cfg(not(unix))]
    pub async fn open<H: ControlHandler>(
        endpoint: ControlEndpoint,
        _handler: Arc<H>,
    ) -> io::Result<Self> {
        let _ = endpoint;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "control sockets require unix domain sockets",
        ))
    }

    #[cfg(unix)]
    pub async fn open<H: ControlHandler>(
        endpoint: ControlEndpoint,
        handler: Arc<H>,
    ) -> io::Result<Self> {
        fs::create_dir_all(&endpoint.directory)?;
        let _ = fs::set_permissions(&endpoint.directory, fs::Permissions::from_mode(0o700));

        match fs::remove_file(&endpoint.socket_path) {
            Ok(()) => {
                debug!(event = "control_uds_stale_removed", socket = %endpoint.socket_path.display());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(&endpoint.socket_path)?;
        let _ = fs::set_permissions(&endpoint.socket_path, fs::Permissions::from_mode(0o600));
        let bound_file = file_key(&endpoint.socket_path);

        info!(event = "control_uds_start", socket = %endpoint.socket_path.display());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, handler, shutdown_rx));

        Ok(Self {
            endpoint,
            shutdown,
            task: Some(task),
            bound_file,
        })
    }

    /// Stops accepting, waits for the listener to close, then unlinks the socket file.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(err) = task.await {
            warn!(event = "control_uds_join_error", error = %err);
        }
        info!(event = "control_uds_stop", socket = %self.endpoint.socket_path.display());
        if file_key(&self.endpoint.socket_path) != self.bound_file {
            debug!(event = "control_uds_socket_replaced", socket = %self.endpoint.socket_path.display());
            return;
        }
        match std::fs::remove_file(&self.endpoint.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    event = "control_uds_unlink_error",
                    socket = %self.endpoint.socket_path.display(),
                    error = %err
                );
            }
        }
    }
}

#[cfg(unix)]
fn file_key(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    fs::symlink_metadata(path)
        .ok()
        .map(|meta| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_key(_path: &Path) -> Option<(u64, u64)> {
    None
}

#[cfg(unix)]
async fn accept_loop<H: ControlHandler>(
    listener: UnixListener,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handle_connection(handler, stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "control_uds_accept_error", error = %err);
                    }
                }
            }
        }
    }
    drop(listener);
}

#[cfg(unix)]
async fn handle_connection<H: ControlHandler>(handler: Arc<H>, mut stream: UnixStream) {
    let mut buf = vec![0u8; MAX_COMMAND_BYTES];
    let read = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(read)) => read,
        Ok(Err(err)) => {
            warn!(event = "control_uds_read_error", error = %err);
            return;
        }
        Err(_) => {
            debug!(event = "control_uds_read_timeout");
            return;
        }
    };
    if read == 0 {
        return;
    }

    let command = ControlCommand::parse(&String::from_utf8_lossy(&buf[..read]));
    info!(event = "control_command", command = %command);

    if command == ControlCommand::Stop {
        write_reply(&mut stream, &Reply::Ok(None)).await;
        drop(stream);
        let stop = tokio::spawn(async move { handler.stop().await });
        if let Err(err) = stop.await {
            warn!(event = "control_stop_failed", error = %err);
        }
        return;
    }

    let reply = dispatch(handler, command).await;
    write_reply(&mut stream, &reply).await;
}

/// Runs the handler in its own task so a panic becomes an `error:` reply instead of a dead channel.
async fn dispatch<H: ControlHandler>(handler: Arc<H>, command: ControlCommand) -> Reply {
    match command {
        ControlCommand::Restart => {
            let outcome = tokio::spawn(async move { handler.restart().await }).await;
            match outcome {
                Ok(Ok(url)) if url.is_empty() => Reply::Ok(None),
                Ok(Ok(url)) => Reply::Ok(Some(url)),
                Ok(Err(err)) => {
                    warn!(event = "control_restart_failed", error = %err);
                    Reply::Error(format!("{err:#}"))
                }
                Err(err) => Reply::Error(format!("restart handler failed: {err}")),
            }
        }
        ControlCommand::Info => match tokio::spawn(async move { handler.info() }).await {
            Ok(snapshot) => Reply::Info(snapshot),
            Err(err) => Reply::Error(format!("info handler failed: {err}")),
        },
        ControlCommand::Stop => Reply::Ok(None),
        ControlCommand::Unknown(raw) => {
            debug!(event = "control_unknown_command", command = %raw);
            Reply::Error(UNKNOWN_COMMAND.to_string())
        }
    }
}

#[cfg(unix)]
async fn write_reply(stream: &mut UnixStream, reply: &Reply) {
    let mut line = reply.encode();
    line.push('\n');
    let send = async {
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(WRITE_TIMEOUT, send).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(event = "control_uds_write_error", error = %err),
        Err(_) => warn!(event = "control_uds_write_timeout"),
    }
}
