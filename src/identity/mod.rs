//! Node Identity Module
//!
//! Every master and slave process is identified by the tuple
//! `(host, ip, port, start_time)`. The canonical wire form is
//! `"<host>:<port>:<start_time_ms>"`, which doubles as the directory key and
//! the display string in logs.
//!
//! ## Equality
//! Two identities are equal when host, port and start time match. A restarted
//! process therefore gets a *different* identity; use
//! [`NodeIdentity::same_host_and_port`] to ask "same node, possibly
//! restarted?". The resolved `ip` is metadata only and never takes part in
//! comparisons, so parsing the canonical string always yields an equal value.

pub mod types;

pub use types::{NodeIdentity, local_hostname, now_ms};
