use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Directory prefixes a client may write to or delete from.
///
/// Only temporary storage is allowed: anything else on the device (boot
/// configuration, overlay layers, system binaries, credentials) is off limits.
pub const ALLOWED_PREFIXES: [&str; 2] = ["/tmp/", "/var/tmp/"];

/// Where the host filesystem is mounted when the agent runs in a container.
pub const DEFAULT_HOST_MOUNT: &str = "/mnt/host";

/// Validates client-supplied paths and maps them onto the real filesystem.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    host_mount: PathBuf,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_MOUNT)
    }
}

impl PathPolicy {
    /// Creates a policy that translates through `host_mount` when it exists.
    pub fn new(host_mount: impl Into<PathBuf>) -> Self {
        Self {
            host_mount: host_mount.into(),
        }
    }

    pub fn host_mount(&self) -> &Path {
        &self.host_mount
    }

    /// Validates `raw` and returns its normalized form.
    ///
    /// Rejects, in order:
    /// - relative paths
    /// - paths that still contain `..` after normalization
    /// - paths not strictly under one of [`ALLOWED_PREFIXES`]
    ///
    /// Performs no I/O.
    pub fn validate(&self, raw: &str) -> Result<PathBuf, TransferError> {
        if !Path::new(raw).is_absolute() {
            return Err(TransferError::InvalidPath(format!(
                "path must be absolute, got: {raw}"
            )));
        }

        let clean = normalize(Path::new(raw));

        if clean
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(TransferError::InvalidPath(format!(
                "path traversal not allowed: {raw}"
            )));
        }

        let clean_str = clean.to_string_lossy();
        if !ALLOWED_PREFIXES
            .iter()
            .any(|prefix| clean_str.starts_with(prefix))
        {
            return Err(TransferError::InvalidPath(format!(
                "path must be under /tmp/ or /var/tmp/, got: {clean_str}"
            )));
        }

        Ok(clean)
    }

    /// Maps a validated path onto the host filesystem.
    ///
    /// When the host mount directory exists the agent is running inside a
    /// container, and `/tmp/fw.bin` becomes `/mnt/host/tmp/fw.bin`. Otherwise
    /// the path is returned unchanged.
    pub fn translate(&self, clean: &Path) -> PathBuf {
        if self.host_mount.exists() {
            let relative = clean.strip_prefix("/").unwrap_or(clean);
            self.host_mount.join(relative)
        } else {
            clean.to_path_buf()
        }
    }

    /// [`validate`](Self::validate) followed by [`translate`](Self::translate).
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, TransferError> {
        let clean = self.validate(raw)?;
        Ok(self.translate(&clean))
    }
}

/// Lexically normalizes a path: drops `.`, resolves `..` against the
/// preceding segment, and keeps `..` at the root pinned to the root.
///
/// Leading `..` segments of a relative path are preserved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(name) => out.push(name),
        }
    }
    out
}
