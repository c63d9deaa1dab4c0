use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_BASE_PORT: u16 = 3000;
pub const PORT_ENV: &str = "DEVCTL_PORT";
pub const PORT_OFFSET_ENV: &str = "DEVCTL_PORT_OFFSET";
pub const CONTROL_DIR_ENV: &str = "DEVCTL_CONTROL_DIR";
pub const CONTROL_DIR_NAME: &str = ".dev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub base_port: u16,
    pub warnings: Vec<String>,
}

/// Accepts integers in `1..=65535`.
pub fn parse_port_value(raw: &str) -> Option<u16> {
    let value = raw.trim().parse::<u32>().ok()?;
    if value == 0 || value > u16::MAX as u32 {
        return None;
    }
    Some(value as u16)
}

pub fn resolve_base_port<F>(flag: Option<u16>, lookup: F) -> PortSettings
where
    F: Fn(&str) -> Option<String>,
{
    let mut warnings = Vec::new();

    let env_port = read_port_var(PORT_ENV, &lookup, &mut warnings);
    let base = flag.filter(|port| *port > 0).or(env_port).unwrap_or(DEFAULT_BASE_PORT);

    let offset = read_port_var(PORT_OFFSET_ENV, &lookup, &mut warnings);
    let base_port = match offset {
        Some(offset) => match base.checked_add(offset) {
            Some(port) => port,
            None => {
                let message = format!(
                    "ignoring {PORT_OFFSET_ENV}={offset}: {base} + {offset} exceeds 65535"
                );
                warn!(event = "port_offset_ignored", base, offset);
                warnings.push(message);
                base
            }
        },
        None => base,
    };

    PortSettings {
        base_port,
        warnings,
    }
}

pub fn resolve_control_dir<F>(project_root: &Path, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(CONTROL_DIR_ENV) {
        Some(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => project_root.join(CONTROL_DIR_NAME),
    }
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" => Some(false),
        _ => None,
    }
}

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn read_port_var<F>(key: &str, lookup: &F, warnings: &mut Vec<String>) -> Option<u16>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    if raw.trim().is_empty() {
        return None;
    }
    match parse_port_value(&raw) {
        Some(port) => Some(port),
        None => {
            warn!(event = "invalid_port_env", key, value = %raw);
            warnings.push(format!(
                "ignoring {key}={raw}: expected a positive integer no greater than 65535"
            ));
            None
        }
    }
}
