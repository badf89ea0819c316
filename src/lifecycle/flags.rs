use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Independent status facets of a node process. Each flag is its own
/// atomic; no combination is treated as a single state.
#[derive(Debug, Default)]
pub struct NodeFlags {
    stopped: AtomicBool,
    aborted: AtomicBool,
    active: AtomicBool,
    initialized: AtomicBool,
    receptor_started: AtomicBool,
    /// Master only.
    premiered: AtomicBool,
    /// Slave only: teardown has flushed and it is safe to exit.
    exit_safe: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    pub stopped: bool,
    pub aborted: bool,
    pub active: bool,
    pub initialized: bool,
    pub receptor_started: bool,
    pub premiered: bool,
    pub exit_safe: bool,
}

macro_rules! flag_accessors {
    ($($field:ident => $getter:ident, $setter:ident;)*) => {
        $(
            pub fn $getter(&self) -> bool {
                self.$field.load(Ordering::Acquire)
            }

            pub fn $setter(&self, value: bool) {
                self.$field.store(value, Ordering::Release);
            }
        )*
    };
}

impl NodeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    flag_accessors! {
        stopped => is_stopped, set_stopped;
        active => is_active, set_active;
        initialized => is_initialized, set_initialized;
        receptor_started => is_receptor_started, set_receptor_started;
        premiered => is_premiered, set_premiered;
        exit_safe => is_exit_safe, set_exit_safe;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Marks the node aborted and stopped. The first reason is kept; the
    /// return value says whether this call was the first abort.
    pub fn abort(&self, reason: &str) -> bool {
        let first = !self.aborted.swap(true, Ordering::AcqRel);
        if first {
            *self.abort_reason.lock() = Some(reason.to_string());
        }
        self.set_stopped(true);
        first
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            stopped: self.is_stopped(),
            aborted: self.is_aborted(),
            active: self.is_active(),
            initialized: self.is_initialized(),
            receptor_started: self.is_receptor_started(),
            premiered: self.is_premiered(),
            exit_safe: self.is_exit_safe(),
        }
    }
}
