//! Socket path derivation.
//!
//! Every principal gets its own Unix socket under a shared directory:
//!
//! ```text
//! <root>/.ssh_socks/<principal>.sock
//! ```
//!
//! [`socket_path`] is pure string interpolation.  Callers that accept a
//! principal from outside should run [`validate_principal`] first, otherwise
//! a principal such as `../x` resolves outside the socket directory.

use std::io;
use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::KeysockError;

/// Name of the directory (under the temp root) that holds principal sockets.
pub const SOCKET_DIR_NAME: &str = ".ssh_socks";

/// Derive the socket path for `principal` under `root`.
pub fn socket_path(root: &Path, principal: &str) -> PathBuf {
    root.join(SOCKET_DIR_NAME).join(format!("{principal}.sock"))
}

/// Reject principals that cannot name a file inside the socket directory.
pub fn validate_principal(principal: &str) -> Result<(), KeysockError> {
    let bad = principal.is_empty()
        || principal == "."
        || principal == ".."
        || principal.contains('/')
        || principal.contains('\0');
    if bad {
        return Err(KeysockError::InvalidPrincipal(principal.to_string()));
    }
    Ok(())
}

/// Make `path` ready to be bound.
///
/// Creates the parent directory (mode 0700) if needed and unconditionally
/// removes whatever stale entry sits at `path`.  A missing entry is fine.
pub fn prepare_socket_path(path: &Path) -> Result<(), KeysockError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|source| KeysockError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(KeysockError::Bind {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    Ok(())
}

/// Restrict a freshly bound socket file to its owner.
pub fn restrict_socket_permissions(path: &Path) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
