use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Shared shutdown flag, set on the first SIGINT/SIGTERM.
pub(crate) fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Install signal handlers for cooperative shutdown.
///
/// First signal sets the flag and restores the default handler so a
/// second signal terminates immediately.
pub(crate) fn install_signal_handlers() {
    // The flag must exist before a handler can run.
    let _ = shutdown_flag();

    #[cfg(unix)]
    {
        // Safety: signal handler only sets an atomic bool and restores default handler.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
