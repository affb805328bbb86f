//! PID-file lifecycle: write on start, signal on stop, probe on status.

use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_PID_PATH: &str = "/var/run/gatehouse.pid";

pub fn write_pid_file(path: &Path) -> GatewayResult<()> {
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

pub fn read_pid_file(path: &Path) -> GatewayResult<i32> {
    let raw = std::fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("invalid pid file {}", path.display())))
}

pub fn remove_pid_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(target: "gatehouse::pid", error = %err, "could not remove pid file");
        }
    }
}

/// Send SIGTERM to the recorded process.
pub fn stop(path: &Path) -> GatewayResult<()> {
    let pid = read_pid_file(path)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|err| GatewayError::Internal(format!("cannot signal pid {pid}: {err}")))?;
    Ok(())
}

/// Whether the recorded process is alive (signal-0 probe).
pub fn is_running(path: &Path) -> GatewayResult<bool> {
    let pid = read_pid_file(path)?;
    Ok(kill(Pid::from_raw(pid), None).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), std::process::id() as i32);

        // Our own pid is certainly alive.
        assert!(is_running(&path).unwrap());

        remove_pid_file(&path);
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn garbage_pid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(matches!(
            read_pid_file(&path),
            Err(GatewayError::Config(_))
        ));
    }
}
