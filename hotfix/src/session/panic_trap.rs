//! Turning a panic inside a session into a reported error
//!
//! A process-wide panic hook is installed once and chained to the previous
//! one. It only acts for threads currently inside [`trap`]: there it records
//! the backtrace of the panic site and stays silent, since the panic is
//! reported through the session result. Every other panic goes to the
//! previous hook untouched.
//!
//! Inside [`without_backtrace`] the hook records nothing: capturing a
//! backtrace allocates and resolves symbols, which may deadlock against a
//! frozen thread.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static CAPTURED: RefCell<Option<String>> = const { RefCell::new(None) };
    static QUIET: Cell<bool> = const { Cell::new(false) };
    static SKIPPED: Cell<bool> = const { Cell::new(false) };
}

/// Reported instead of a backtrace skipped by [`without_backtrace`]
pub const SKIPPED_BACKTRACE: &str = "<backtrace not captured inside the pause window>";

/// A recovered panic
#[derive(Debug, Clone)]
pub struct Trapped {
    pub message: String,
    /// Backtrace at the panic site; empty if the hook was bypassed
    pub backtrace: String,
}

fn install_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) && QUIET.with(Cell::get) {
                SKIPPED.with(|skipped| skipped.set(true));
            } else if ARMED.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                CAPTURED.with(|captured| *captured.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

/// Run `f`, converting a panic into [`Trapped`]
///
/// # Errors
/// Returns the panic payload and backtrace if `f` panicked
pub fn trap<T>(f: impl FnOnce() -> T) -> Result<T, Trapped> {
    install_hook();
    let was_armed = ARMED.with(|armed| armed.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    ARMED.with(|armed| armed.set(was_armed));

    result.map_err(|payload| Trapped {
        message: payload_message(payload.as_ref()),
        backtrace: CAPTURED.with(|captured| captured.borrow_mut().take()).unwrap_or_else(|| {
            if SKIPPED.with(|skipped| skipped.replace(false)) {
                SKIPPED_BACKTRACE.to_string()
            } else {
                String::new()
            }
        }),
    })
}

/// Restores the previous quiet flag, including while unwinding
struct Quiet(bool);

impl Drop for Quiet {
    fn drop(&mut self) {
        QUIET.with(|quiet| quiet.set(self.0));
    }
}

/// Run `f` with backtrace capture disabled for panics trapped on this thread
pub fn without_backtrace<T>(f: impl FnOnce() -> T) -> T {
    let _restore = Quiet(QUIET.with(|quiet| quiet.replace(true)));
    f()
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
