use std::io;

use tracing::info;

/// Pin both the soft and hard file-descriptor limits. Must run before any
/// socket is opened so every descriptor the process receives is a valid
/// Connection Registry index.
pub fn set_fd_limit(limit: usize) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    info!(limit, "file descriptor limit pinned");
    Ok(())
}

/// Detach from the controlling terminal and redirect stdio to /dev/null.
/// The working directory is kept so a relative asset root stays valid.
/// Must run before the async runtime starts.
pub fn daemonize() -> io::Result<()> {
    if unsafe { libc::daemon(1, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
