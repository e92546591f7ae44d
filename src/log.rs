//! Switchable logging for library code.
//!
//! Library code logs through the `pd_*` macros. A front-end that owns the
//! terminal (the proxy REPL) can mute them without touching the global
//! `log` filter.

use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

#[doc(hidden)]
#[macro_export]
macro_rules! _pd_log {
    ($log_fn: path, target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            $log_fn!(target: $target, $($arg)+)
        }
    };
    ($log_fn: path, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            $log_fn!(target: "pldbg", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! pd_info {
    ($($arg:tt)+) => {
        $crate::_pd_log!(::log::info, $($arg)+)
    };
}

#[macro_export]
macro_rules! pd_warn {
    ($($arg:tt)+) => {
        $crate::_pd_log!(::log::warn, $($arg)+)
    };
}

#[macro_export]
macro_rules! pd_error {
    ($($arg:tt)+) => {
        $crate::_pd_log!(::log::error, $($arg)+)
    };
}

#[macro_export]
macro_rules! pd_debug {
    ($($arg:tt)+) => {
        $crate::_pd_log!(::log::debug, $($arg)+)
    };
}
