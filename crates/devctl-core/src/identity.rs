use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Component, Path, PathBuf},
};
use tracing::debug;

pub const PROJECT_DESCRIPTOR: &str = "devctl.toml";
pub const PACKAGE_DESCRIPTOR: &str = "package.json";
const HASH_LEN: usize = 6;

/// Stable name for one project instance. The id doubles as the control socket filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(name: &str, hash_input: &str) -> Self {
        let name = sanitize_component(name);
        let id = format!("{name}-{}", short_hash(hash_input));
        Self { id, name }
    }

    pub fn socket_file_name(&self) -> String {
        format!("{}.sock", self.id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProjectDescriptor {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageDescriptor {
    #[serde(default)]
    name: Option<String>,
}

pub fn resolve(cwd: &Path) -> Identity {
    let absolute = absolute_path(cwd);
    let name = read_descriptor_name(&absolute).unwrap_or_else(|| fallback_name(&absolute));
    Identity::new(&name, &absolute.to_string_lossy())
}

/// Identity shared by every invocation over the same set of directories, regardless of order.
pub fn resolve_for_set<P: AsRef<Path>>(name: &str, dirs: &[P]) -> Identity {
    let mut keys = dirs
        .iter()
        .map(|dir| absolute_path(dir.as_ref()).to_string_lossy().to_string())
        .collect::<Vec<_>>();
    keys.sort();
    keys.dedup();
    Identity::new(name, &keys.join("\n"))
}

pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest.iter() {
        if out.len() >= HASH_LEN {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(HASH_LEN);
    out
}

pub fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .trim_start_matches('@')
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        "app".to_string()
    } else {
        cleaned
    }
}

fn read_descriptor_name(dir: &Path) -> Option<String> {
    let toml_path = dir.join(PROJECT_DESCRIPTOR);
    if let Ok(raw) = fs::read_to_string(&toml_path) {
        match toml::from_str::<ProjectDescriptor>(&raw) {
            Ok(descriptor) => {
                if let Some(name) = descriptor.name.filter(|value| !value.trim().is_empty()) {
                    return Some(name);
                }
            }
            Err(err) => {
                debug!(event = "descriptor_parse_error", path = %toml_path.display(), error = %err);
            }
        }
    }

    let package_path = dir.join(PACKAGE_DESCRIPTOR);
    let raw = fs::read_to_string(&package_path).ok()?;
    match serde_json::from_str::<PackageDescriptor>(&raw) {
        Ok(descriptor) => descriptor.name.filter(|value| !value.trim().is_empty()),
        Err(err) => {
            debug!(event = "descriptor_parse_error", path = %package_path.display(), error = %err);
            None
        }
    }
}

fn fallback_name(dir: &Path) -> String {
    dir.file_name()
        .map(|segment| segment.to_string_lossy().to_string())
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "app".to_string())
}

/// Canonical form of `path`, so `.`, `..` and symlinked spellings of one directory hash alike.
/// Directories that cannot be canonicalized (e.g. not created yet) are normalized lexically.
fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    fs::canonicalize(&joined).unwrap_or_else(|_| normalize_lexically(&joined))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
