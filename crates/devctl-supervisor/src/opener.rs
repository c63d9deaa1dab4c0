use std::process::{Command, Stdio};
use tracing::debug;

/// Opens a URL for the operator. Failures are the implementation's problem, never the caller's.
pub trait UrlOpener: Send + Sync + 'static {
    fn open(&self, url: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) {
        let mut cmd = browser_command(url);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match cmd.spawn() {
            Ok(mut child) => {
                debug!(event = "browser_open", url);
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(err) => debug!(event = "browser_open_failed", url, error = %err),
        }
    }
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", "start", "", url]);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn browser_command(url: &str) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    cmd
}
