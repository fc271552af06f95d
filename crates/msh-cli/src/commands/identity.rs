//! `meshsh identity`

use std::path::Path;

use anyhow::Result;

use super::load_identity;
use crate::output::print_field;

/// Print the identity hash, and with `listen` the destination it serves
pub fn identity_command(identity_path: &Path, service: &str, listen: bool) -> Result<()> {
    let identity = load_identity(identity_path)?;
    print_field("Identity", &identity.hash().to_string());
    if listen {
        print_field("Listening on", &identity.destination(service).to_string());
    }
    Ok(())
}
