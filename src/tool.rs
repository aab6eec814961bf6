//! Location and invocation of the external tunnel client.
//!
//! Downloading the client is someone else's job; this module only checks
//! that a usable executable exists and knows its command-line contract.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ValidationError;

/// Verified path to the tunnel client executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationTool {
    path: PathBuf,
}

impl ValidationTool {
    /// Checks that `path` is an existing regular file, marking it executable
    /// on Unix if needed.
    pub fn verify(path: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let path = path.into();
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ValidationError::ToolMissing(path));
            }
            Err(source) => return Err(ValidationError::ToolUnreadable { path, source }),
        };
        if !meta.is_file() {
            return Err(ValidationError::ToolNotFile(path));
        }
        ensure_executable(&path, &meta)?;
        Ok(Self { path })
    }

    /// Finds an installed client below `dir`, checking the platform folder
    /// for the current file name first and the legacy name second.
    pub fn locate(dir: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let platform_dir = dir.as_ref().join(platform_dir_name());
        let candidates = client_file_names();
        for name in &candidates {
            let p = platform_dir.join(name);
            if p.is_file() {
                debug!(path = %p.display(), "found tunnel client");
                return Self::verify(p);
            }
        }
        let primary = candidates
            .into_iter()
            .next()
            .map(|n| platform_dir.join(n))
            .unwrap_or(platform_dir);
        Err(ValidationError::ToolMissing(primary))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arguments for one tunnel bound to `port`, with the candidate resolver
    /// first and the fallback resolver second.
    pub fn args(resolver: Ipv4Addr, fallback: &str, port: u16, domain: &str) -> Vec<String> {
        vec![
            "--resolver".into(),
            format!("{resolver}:53"),
            "--resolver".into(),
            fallback.to_string(),
            "--tcp-listen-port".into(),
            port.to_string(),
            "--domain".into(),
            domain.to_string(),
        ]
    }
}

fn platform_dir_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "mac",
        "windows" => "windows",
        _ => "linux",
    }
}

fn client_file_names() -> Vec<String> {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        _ => "amd64",
    };
    match std::env::consts::OS {
        "windows" => vec![
            "slipstream-client-windows-amd64.exe".into(),
            "slipstream-client.exe".into(),
        ],
        "macos" => vec![
            format!("slipstream-client-darwin-{arch}"),
            "slipstream-client".into(),
        ],
        _ => vec![
            "slipstream-client-linux-amd64".into(),
            "slipstream-client".into(),
        ],
    }
}

#[cfg(unix)]
fn ensure_executable(path: &Path, meta: &fs::Metadata) -> Result<(), ValidationError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode();
    if mode & 0o111 == 0 {
        debug!(path = %path.display(), "setting executable bit on tunnel client");
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o755))
            .map_err(|source| ValidationError::ToolPermissions {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path, _meta: &fs::Metadata) -> Result<(), ValidationError> {
    Ok(())
}
