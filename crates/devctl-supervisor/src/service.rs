use std::{io, net::TcpListener};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

/// Something the supervisor can bind to a port and later retire.
pub trait Listenable: Send + Sync + 'static {
    fn listen(&self, port: u16) -> io::Result<RunningService>;
}

/// Handle for the listener currently bound by a [`Listenable`].
pub struct RunningService {
    port: u16,
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RunningService {
    pub fn new(port: u16, url: String, shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            port,
            url,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolves once the serving task has finished and its listener is closed.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(event = "service_task_join_error", port = self.port, error = %err);
            }
        }
        debug!(event = "service_stopped", port = self.port);
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Binds a non-blocking std listener on `host:port`, ready for `tokio::net::TcpListener::from_std`.
pub fn bind_tcp(host: &str, port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

pub fn http_url(host: &str, port: u16) -> String {
    let display_host = match host {
        "127.0.0.1" | "0.0.0.0" | "::" | "::1" => "localhost",
        other => other,
    };
    format!("http://{display_host}:{port}")
}
