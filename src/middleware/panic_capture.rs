//! Panic location and backtrace capture.
//!
//! `catch_unwind` only hands over the panic payload. [`install`] adds a panic
//! hook that records where the panic happened and a backtrace in a
//! thread-local slot, which the panic handler of the request logging layer
//! picks up with [`take`] on the same thread right after unwinding.

use std::{backtrace::Backtrace, cell::RefCell, panic, sync::Once};

/// Where a panic happened, captured by the hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    /// `file:line` of the panic.
    pub location: Option<String>,
    pub backtrace: String,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install the capturing hook once per process.
///
/// The previously installed hook still runs, so panics keep being printed.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let report = PanicReport {
                location: info
                    .location()
                    .map(|location| format!("{}:{}", location.file(), location.line())),
                backtrace: Backtrace::force_capture().to_string(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
            previous(info);
        }));
    });
}

/// Take the report of the last panic on this thread.
pub fn take() -> Option<PanicReport> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}
