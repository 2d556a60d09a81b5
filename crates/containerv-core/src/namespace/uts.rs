//! UTS namespace hostname handling.

use containerv_common::error::{ContainervError, Result};

/// Maximum hostname length accepted by the kernel.
pub const HOST_NAME_MAX: usize = 64;

/// Checks that `name` is a valid RFC 1123 host label.
///
/// # Errors
///
/// Returns `InvalidSpec` describing the first problem found.
pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > HOST_NAME_MAX {
        return Err(ContainervError::invalid(format!(
            "hostname must be 1-{HOST_NAME_MAX} bytes: {name:?}"
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(ContainervError::invalid(format!(
            "hostname may not start or end with '-': {name:?}"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ContainervError::invalid(format!(
            "hostname has invalid characters: {name:?}"
        )));
    }
    Ok(())
}

/// Sets the hostname inside the current UTS namespace.
///
/// # Errors
///
/// Returns the errno if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(name: &str) -> std::result::Result<(), nix::errno::Errno> {
    nix::unistd::sethostname(name)
}
