//! Host and process identity used to lay out lock directories.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Network node name of this machine, or `"localhost"` if it cannot be read.
#[must_use]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Process id of the caller.
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with the given pid currently exists.
///
/// Sends the null signal. `EPERM` means the process exists but belongs to
/// someone else, so it counts as alive. A recycled pid is indistinguishable
/// from the original holder.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
