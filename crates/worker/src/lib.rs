//! Process wiring for the Atelier worker.
//!
//! [`config`] reads the environment; [`worker`] connects storage and the
//! compute backend and runs the reconciliation loop until shutdown.
//! [`intake`] turns JSON command lines into [`JobService`] calls.
//!
//! [`JobService`]: atelier_pipeline::service::JobService

pub mod config;
pub mod intake;
pub mod worker;
