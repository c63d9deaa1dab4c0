use devctl_core::identity::{sanitize_component, PACKAGE_DESCRIPTOR, PROJECT_DESCRIPTOR};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const DEV_SCRIPT: &str = "dev";
const NESTED_ROOTS: [&str; 2] = ["apps", "packages"];

/// A child-process unit: `command` is an argv list spawned directly with `dir` as its working
/// directory. Shell lines from the manifest arrive already wrapped by [`shell_argv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub name: String,
    pub dir: PathBuf,
    pub command: Vec<String>,
}

impl Workspace {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[cfg(unix)]
pub fn shell_argv(line: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), line.to_string()]
}

#[cfg(not(unix))]
pub fn shell_argv(line: &str) -> Vec<String> {
    vec!["cmd".to_string(), "/C".to_string(), line.to_string()]
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("no workspaces with a `dev` command found under {}", root.display())]
    NoneFound { root: PathBuf },
    #[error("unknown workspace `{0}`")]
    Unknown(String),
    #[error("invalid selection `{0}`")]
    InvalidSelection(String),
    #[error("invalid {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    workspace: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    #[serde(default)]
    dir: Option<PathBuf>,
    command: ManifestCommand,
}

/// `command = "npm run dev"` runs through the shell; `command = ["mdbook", "serve"]` does not.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestCommand {
    Line(String),
    Argv(Vec<String>),
}

impl ManifestCommand {
    fn into_argv(self) -> Option<Vec<String>> {
        match self {
            ManifestCommand::Line(line) if line.trim().is_empty() => None,
            ManifestCommand::Line(line) => Some(shell_argv(&line)),
            ManifestCommand::Argv(argv) => argv
                .first()
                .is_some_and(|program| !program.trim().is_empty())
                .then_some(argv),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageScripts {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// Workspaces declared in `devctl.toml`, else every package exposing a `dev` script.
pub fn discover(root: &Path) -> Result<Vec<Workspace>, WorkspaceError> {
    let declared = read_manifest(root)?;
    let found = if declared.is_empty() {
        scan_packages(root)
    } else {
        declared
    };
    if found.is_empty() {
        return Err(WorkspaceError::NoneFound {
            root: root.to_path_buf(),
        });
    }
    Ok(found)
}

fn read_manifest(root: &Path) -> Result<Vec<Workspace>, WorkspaceError> {
    let path = root.join(PROJECT_DESCRIPTOR);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let manifest: Manifest = toml::from_str(&raw).map_err(|err| WorkspaceError::Manifest {
        path: path.clone(),
        message: err.to_string(),
    })?;

    let mut workspaces = Vec::with_capacity(manifest.workspace.len());
    for entry in manifest.workspace {
        let Some(command) = entry.command.into_argv() else {
            return Err(WorkspaceError::Manifest {
                path,
                message: format!("workspace `{}` has an empty command", entry.name),
            });
        };
        let dir = entry.dir.unwrap_or_else(|| PathBuf::from(&entry.name));
        workspaces.push(Workspace {
            name: sanitize_component(&entry.name),
            dir: root.join(dir),
            command,
        });
    }
    Ok(workspaces)
}

fn scan_packages(root: &Path) -> Vec<Workspace> {
    let runner = package_runner(root);
    let mut candidates = child_dirs(root);
    for nested in NESTED_ROOTS {
        candidates.extend(child_dirs(&root.join(nested)));
    }

    let mut seen = HashSet::new();
    let mut workspaces = Vec::new();
    for dir in candidates {
        if !has_dev_script(&dir) {
            continue;
        }
        let name = dir
            .file_name()
            .map(|segment| sanitize_component(&segment.to_string_lossy()))
            .unwrap_or_else(|| "app".to_string());
        if !seen.insert(name.clone()) {
            debug!(event = "workspace_name_collision", name = %name, dir = %dir.display());
            continue;
        }
        workspaces.push(Workspace {
            name,
            dir,
            command: vec![runner.to_string(), "run".to_string(), DEV_SCRIPT.to_string()],
        });
    }
    workspaces
}

fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.') && name != "node_modules")
        })
        .collect::<Vec<_>>();
    dirs.sort();
    dirs
}

fn has_dev_script(dir: &Path) -> bool {
    let path = dir.join(PACKAGE_DESCRIPTOR);
    let Ok(raw) = fs::read_to_string(&path) else {
        return false;
    };
    match serde_json::from_str::<PackageScripts>(&raw) {
        Ok(package) => package.scripts.contains_key(DEV_SCRIPT),
        Err(err) => {
            debug!(event = "package_parse_error", path = %path.display(), error = %err);
            false
        }
    }
}

fn package_runner(root: &Path) -> &'static str {
    if root.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if root.join("yarn.lock").exists() {
        "yarn"
    } else if root.join("bun.lockb").exists() || root.join("bun.lock").exists() {
        "bun"
    } else {
        "npm"
    }
}

/// Picks workspaces by name, keeping the requested order and dropping repeats.
pub fn select_named(
    all: &[Workspace],
    names: &[String],
) -> Result<Vec<Workspace>, WorkspaceError> {
    let mut selected: Vec<Workspace> = Vec::new();
    for name in names {
        let wanted = name.trim();
        let found = all
            .iter()
            .find(|workspace| workspace.name == wanted || workspace.name == sanitize_component(wanted))
            .ok_or_else(|| WorkspaceError::Unknown(wanted.to_string()))?;
        if !selected.iter().any(|workspace| workspace.name == found.name) {
            selected.push(found.clone());
        }
    }
    Ok(selected)
}

/// Parses `1,3`, `2 4` or `all` into zero-based indexes. Empty input picks the first entry.
pub fn parse_selection(input: &str, count: usize) -> Result<Vec<usize>, WorkspaceError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(vec![0]);
    }
    if trimmed.eq_ignore_ascii_case("all") {
        return Ok((0..count).collect());
    }

    let mut indexes = Vec::new();
    for token in trimmed
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty())
    {
        let index = token
            .parse::<usize>()
            .ok()
            .filter(|value| (1..=count).contains(value))
            .ok_or_else(|| WorkspaceError::InvalidSelection(token.to_string()))?;
        if !indexes.contains(&(index - 1)) {
            indexes.push(index - 1);
        }
    }
    Ok(indexes)
}

/// Numbered menu on `output`, one answer line from `input`.
pub fn prompt_selection<R: BufRead, W: Write>(
    all: &[Workspace],
    mut input: R,
    mut output: W,
) -> Result<Vec<Workspace>, WorkspaceError> {
    if all.is_empty() {
        return Ok(Vec::new());
    }
    writeln!(output, "Workspaces with a `{DEV_SCRIPT}` command:")?;
    for (index, workspace) in all.iter().enumerate() {
        writeln!(
            output,
            "  {}) {} ({})",
            index + 1,
            workspace.name,
            workspace.dir.display()
        )?;
    }
    write!(output, "Select workspaces (e.g. 1,2 or all) [1]: ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(parse_selection(&answer, all.len())?
        .into_iter()
        .map(|index| all[index].clone())
        .collect())
}
