//! Executable resolution for MCP server subprocesses.
//!
//! A desktop-launched process often inherits a minimal PATH that lacks the
//! directories an interactive shell adds (Homebrew, nvm, cargo, …). The
//! resolver finds a launchable path for a logical command name and builds an
//! augmented PATH for the child process.
//!
//! Resolution order:
//! 1. Path-like input (contains a separator) is returned unchanged.
//! 2. A bundled wrapper script for the current OS/shell family.
//! 3. Well-known install locations, including version-manager directories.
//! 4. A `which`-style lookup over the inherited PATH.
//! 5. The bare name, left to the OS at spawn time.
//!
//! Every step falls through silently; resolution never fails.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

// ─── Platform Helpers ────────────────────────────────────────────────────────

/// PATH entries every platform install is expected to have.
fn platform_standard_dirs() -> Vec<PathBuf> {
    if cfg!(target_os = "windows") {
        let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".into());
        vec![
            PathBuf::from(&system_root).join("System32"),
            PathBuf::from(&system_root),
            PathBuf::from(r"C:\Program Files\nodejs"),
        ]
    } else {
        ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"]
            .iter()
            .map(PathBuf::from)
            .collect()
    }
}

/// File names a command may be installed under on this platform.
fn candidate_file_names(name: &str) -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec![format!("{name}.exe"), format!("{name}.cmd"), format!("{name}.bat")]
    } else {
        vec![name.to_string()]
    }
}

/// Wrapper script names matching the current OS/shell family.
fn wrapper_file_names(name: &str) -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec![format!("{name}.cmd"), format!("{name}.ps1")]
    } else {
        vec![format!("{name}.sh"), name.to_string()]
    }
}

/// Whether the input already names a location rather than a command.
pub fn is_path_like(name: &str) -> bool {
    name.contains('/') || name.contains('\\')
}

/// Parse `v20.11.1` into a sortable tuple. Unparseable parts sort lowest.
fn node_version_key(dir_name: &str) -> (u64, u64, u64) {
    let mut parts = dir_name
        .trim_start_matches('v')
        .split('.')
        .map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Newest `~/.nvm/versions/node/<version>/bin`, if any version is installed.
fn newest_nvm_bin(home: &Path) -> Option<PathBuf> {
    let versions = home.join(".nvm").join("versions").join("node");
    let entries = std::fs::read_dir(&versions).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .max_by_key(|name| node_version_key(name))
        .map(|name| versions.join(name).join("bin"))
}

// ─── CommandResolver ─────────────────────────────────────────────────────────

/// Resolves logical command names to launchable paths.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    /// Directory holding bundled wrapper scripts shipped with the app.
    bundled_dir: Option<PathBuf>,
    /// The user's home directory, for per-user tool locations.
    home_dir: Option<PathBuf>,
}

impl Default for CommandResolver {
    fn default() -> Self {
        let bundled_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("bin")));
        Self {
            bundled_dir,
            home_dir: dirs::home_dir(),
        }
    }
}

impl CommandResolver {
    pub fn new(bundled_dir: Option<PathBuf>, home_dir: Option<PathBuf>) -> Self {
        Self {
            bundled_dir,
            home_dir,
        }
    }

    /// Resolve `name` to a concrete path, degrading to the bare name.
    pub fn resolve(&self, name: &str) -> PathBuf {
        if is_path_like(name) {
            return PathBuf::from(name);
        }

        if let Some(path) = self.bundled_wrapper(name) {
            tracing::debug!(command = name, path = %path.display(), "resolved bundled wrapper");
            return path;
        }

        if let Some(path) = self.well_known_location(name) {
            tracing::debug!(command = name, path = %path.display(), "resolved from well-known location");
            return path;
        }

        match which::which(name) {
            Ok(path) => {
                tracing::debug!(command = name, path = %path.display(), "resolved from PATH");
                path
            }
            Err(e) => {
                tracing::debug!(command = name, error = %e, "command not resolved, using bare name");
                PathBuf::from(name)
            }
        }
    }

    /// Per-user tool directories, most specific first.
    pub fn home_tool_dirs(&self) -> Vec<PathBuf> {
        let Some(home) = self.home_dir.as_deref() else {
            return Vec::new();
        };

        let mut dirs = Vec::new();
        if cfg!(target_os = "windows") {
            if let Ok(appdata) = std::env::var("APPDATA") {
                dirs.push(PathBuf::from(appdata).join("npm"));
            }
            dirs.push(home.join("scoop").join("shims"));
        } else {
            dirs.push(home.join(".local").join("bin"));
            if let Some(nvm) = newest_nvm_bin(home) {
                dirs.push(nvm);
            }
            dirs.push(home.join(".volta").join("bin"));
            dirs.push(home.join(".asdf").join("shims"));
            dirs.push(home.join(".pyenv").join("shims"));
            dirs.push(home.join(".local").join("share").join("pnpm"));
        }
        dirs.push(home.join(".cargo").join("bin"));
        dirs.push(home.join(".bun").join("bin"));
        dirs.push(home.join(".deno").join("bin"));
        dirs
    }

    /// Build the child PATH: standard dirs ∪ inherited PATH ∪ home tool dirs ∪
    /// explicit overrides. Later layers take precedence, duplicates are dropped.
    pub fn augmented_path(&self, override_path: Option<&str>) -> OsString {
        let inherited = std::env::var_os("PATH").unwrap_or_default();

        let mut layers: Vec<Vec<PathBuf>> = vec![
            platform_standard_dirs(),
            std::env::split_paths(&inherited).collect(),
            self.home_tool_dirs()
                .into_iter()
                .filter(|d| d.is_dir())
                .collect(),
        ];
        if let Some(overrides) = override_path {
            layers.push(std::env::split_paths(overrides).collect());
        }

        let mut merged: Vec<PathBuf> = Vec::new();
        for layer in layers.into_iter().rev() {
            for dir in layer {
                if dir.as_os_str().is_empty() || merged.contains(&dir) {
                    continue;
                }
                merged.push(dir);
            }
        }

        std::env::join_paths(&merged).unwrap_or(inherited)
    }

    fn bundled_wrapper(&self, name: &str) -> Option<PathBuf> {
        let dir = self.bundled_dir.as_deref()?;
        wrapper_file_names(name)
            .into_iter()
            .map(|file| dir.join(file))
            .find(|path| path.is_file())
    }

    fn well_known_location(&self, name: &str) -> Option<PathBuf> {
        let mut dirs = self.home_tool_dirs();
        dirs.extend(platform_standard_dirs());

        let files = candidate_file_names(name);
        dirs.iter()
            .flat_map(|dir| files.iter().map(move |file| dir.join(file)))
            .find(|path| path.is_file())
    }
}

/// Resolve with the default resolver (bundled dir next to the executable,
/// the current user's home).
pub fn resolve_executable_path(name: &str) -> PathBuf {
    CommandResolver::default().resolve(name)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
