use devctl_core::env_config::parse_bool_env;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "DEVCTL_LOG_LEVEL";
pub const LOG_STDERR_ENV: &str = "DEVCTL_LOG_STDERR";
const LOG_DIR_NAME: &str = "logs";

pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

/// Installs the global subscriber. Logs go to `<control_dir>/logs/devctl-<id>.log` and, when
/// `DEVCTL_LOG_STDERR` is set, to stderr as well. Stdout stays reserved for operator output.
pub fn init_logging(control_dir: Option<&Path>, id: &str, debug: bool) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match control_dir {
        Some(dir) => match open_log_file(&dir.join(LOG_DIR_NAME), id) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("log_file_error: {err}");
                LogGuard { file: None }
            }
        },
        None => LogGuard { file: None },
    };
    let mirror = std::env::var(LOG_STDERR_ENV)
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false);

    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), mirror));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct MultiWriter {
    stderr: Option<io::Stderr>,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>, mirror: bool) -> Self {
        Self {
            stderr: mirror.then(io::stderr),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path, id: &str) -> io::Result<LogGuard> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("devctl-{id}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
