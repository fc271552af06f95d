//! Command implementations

mod connect;
mod identity;
mod listen;

pub use connect::{connect_command, ConnectOptions};
pub use identity::identity_command;
pub use listen::{listen_command, ListenOptions};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use msh_core::identity::default_identity_path;
use msh_core::Identity;

/// Identity file to use: the command line, then the config file, then the default
pub fn identity_path(cli: Option<&Path>, configured: Option<&Path>, listener: bool) -> PathBuf {
    cli.or(configured)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_identity_path(listener))
}

/// Load an identity, creating it on first use
pub(crate) fn load_identity(path: &Path) -> Result<Identity> {
    Identity::load_or_generate(path)
        .with_context(|| format!("Failed to load identity from {:?}", path))
}
