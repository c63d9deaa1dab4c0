use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

/// Destination for operator-facing lines (status, warnings, labeled child output).
pub trait LineSink: Send + Sync + 'static {
    fn line(&self, text: &str);

    fn warning(&self, text: &str) {
        self.line(&format!("warning: {text}"));
    }
}

/// Stdout sink. While the terminal is in raw mode every line ends with `\r\n`.
#[derive(Debug, Default)]
pub struct Console {
    raw_mode: AtomicBool,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_raw_mode(&self, enabled: bool) {
        self.raw_mode.store(enabled, Ordering::SeqCst);
    }
}

impl LineSink for Console {
    fn line(&self, text: &str) {
        let ending = if self.raw_mode.load(Ordering::SeqCst) {
            "\r\n"
        } else {
            "\n"
        };
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "{text}{ending}");
        let _ = stdout.flush();
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl LineSink for CollectingSink {
    fn line(&self, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(text.to_string());
        }
    }
}
