use axum::{extract::State, routing::get, Router};
use devctl_core::Identity;
use devctl_supervisor::{
    service::{bind_tcp, http_url},
    Listenable, RunningService,
};
use std::{future::IntoFuture, io, sync::Arc, time::Duration};
use tokio::sync::{oneshot, Notify};
use tracing::{error, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Plain-text page naming the instance, served on whatever port the supervisor picks.
#[derive(Debug, Clone)]
pub struct StatusService {
    host: String,
    identity: Identity,
}

impl StatusService {
    pub fn new(host: impl Into<String>, identity: Identity) -> Self {
        Self {
            host: host.into(),
            identity,
        }
    }
}

struct StatusState {
    name: String,
    id: String,
    url: String,
}

impl Listenable for StatusService {
    fn listen(&self, port: u16) -> io::Result<RunningService> {
        let listener = tokio::net::TcpListener::from_std(bind_tcp(&self.host, port)?)?;
        let url = http_url(&self.host, port);
        let state = Arc::new(StatusState {
            name: self.identity.name.clone(),
            id: self.identity.id.clone(),
            url: url.clone(),
        });
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .fallback(status_page)
            .with_state(state);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let drain = Arc::new(Notify::new());
            let signal = drain.clone();
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .into_future();
            tokio::pin!(serve);

            tokio::select! {
                result = &mut serve => {
                    if let Err(err) = result {
                        error!(event = "status_service_error", port, error = %err);
                    }
                }
                _ = shutdown_rx => {
                    drain.notify_one();
                    match tokio::time::timeout(SHUTDOWN_GRACE, &mut serve).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(event = "status_service_error", port, error = %err),
                        Err(_) => warn!(event = "status_service_forced_stop", port),
                    }
                }
            }
        });

        Ok(RunningService::new(port, url, shutdown, task))
    }
}

async fn status_page(State(state): State<Arc<StatusState>>) -> String {
    format!("{} ({})\nlistening on {}\n", state.name, state.id, state.url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .expect("free port")
    }

    #[tokio::test]
    async fn serves_status_and_releases_port_on_stop() {
        let port = free_port();
        let service = StatusService::new("127.0.0.1", Identity::new("site", "/srv/site"));
        let running = service.listen(port).expect("listen");
        assert_eq!(running.url(), format!("http://localhost:{port}"));

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect");
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("request");
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
            .await
            .expect("response in time")
            .expect("read response");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("site ("));

        tokio::time::timeout(Duration::from_secs(5), running.stop())
            .await
            .expect("stop in time");
        std::net::TcpListener::bind(("127.0.0.1", port)).expect("port free after stop");
    }
}
