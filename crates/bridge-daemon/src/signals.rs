//! Process signal policy.
//!
//! SIGINT and SIGTERM request a graceful shutdown once; the handler resets
//! itself, so a second signal terminates the process. SIGPIPE is ignored.
//!
//! The token should carry a wake pipe so a blocked wait returns at once.

use std::io;
use std::sync::OnceLock;

use bridge_core::ShutdownToken;

static SHUTDOWN: OnceLock<ShutdownToken> = OnceLock::new();

extern "C" fn request_shutdown(_signal: libc::c_int) {
    // An atomic store and a pipe write, both async-signal-safe.
    if let Some(shutdown) = SHUTDOWN.get() {
        shutdown.request();
    }
}

pub fn install(shutdown: &ShutdownToken) -> io::Result<()> {
    SHUTDOWN.set(shutdown.clone()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            "signal handlers already installed",
        )
    })?;

    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores into an atomic that outlives the process.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = request_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    // SAFETY: ignoring SIGPIPE has no preconditions.
    if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
