//! OS immutable flag, best effort.
//!
//! Hash verification is authoritative; the flag only makes accidental
//! deletion harder where the host supports it (Linux `chattr`, usually as root).

use std::path::Path;

/// Set or clear the immutable attribute. Returns whether the OS accepted it.
#[cfg(target_os = "linux")]
pub fn set_immutable(path: &Path, on: bool) -> bool {
    let flag = if on { "+i" } else { "-i" };
    match std::process::Command::new("chattr").arg(flag).arg(path).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            tracing::debug!(
                path = %path.display(),
                flag,
                "chattr refused: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), "chattr unavailable: {}", e);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_immutable(path: &Path, _on: bool) -> bool {
    tracing::debug!(path = %path.display(), "immutable flag not supported on this platform");
    false
}
