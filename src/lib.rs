//! Release auditor: verifies published release artifacts and signs each
//! verified digest at most once.
//!
//! Stable releases are read from disk, their tags tracked by an
//! [`tracker::AuditTracker`], and each tag reconciled by a worker pool
//! draining a [`queue::DelayingQueue`]. Verification runs either on this
//! host or as a throttled container job.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod exec;
pub mod jobs;
pub mod logging;
pub mod queue;
pub mod reconcile;
pub mod release;
pub mod signing;
pub mod throttle;
pub mod tracker;
pub mod verify;
