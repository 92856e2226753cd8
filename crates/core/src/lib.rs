//! Domain types shared by every Atelier crate.
//!
//! Holds the job identifiers, the [`progress::Progress`] value type, the
//! per-preset step schedules that translate backend pipeline events into
//! progress fractions, and the small layout/seed helpers used when a job
//! is described.

pub mod error;
pub mod layout;
pub mod preset;
pub mod progress;
pub mod seed;
pub mod types;
