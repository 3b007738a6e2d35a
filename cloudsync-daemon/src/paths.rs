use std::path::{Path, PathBuf};

pub const DAEMON_LABEL: &str = "dev.cloudsync.daemon";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_LOG: &str = "daemon.log";

pub fn cloudsync_root(home: &Path) -> PathBuf {
    home.join(".cloudsync")
}

pub fn run_dir(home: &Path) -> PathBuf {
    cloudsync_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    cloudsync_root(home).join("logs")
}

pub fn log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_LOG)
}
