use brig_runtime::Context;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Cancel `ctx` on the first Ctrl-C; exit on the second.
///
/// Cancellation lets in-flight operations tear their container down before the
/// process ends.
pub fn install_signal_handler(ctx: &Context) {
    let ctx = ctx.clone();
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\ninterrupt received, cleaning up...");
        ctx.cancel();
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
