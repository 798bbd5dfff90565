use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Kill the entire process group led by `pid` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. Returns `false` if the PID cannot be represented as
/// `i32` or the group no longer exists.
pub(crate) fn kill_process_group(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let pgid = nix::unistd::Pid::from_raw(pid);
    nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL).is_ok()
}

/// Shell-style exit code: the status code, or `128 + signal` when killed.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_from_raw_status() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // Terminated by SIGKILL (9).
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
