//! Job orchestration above individual job handles.
//!
//! - [`registry`]: the shared map of live jobs
//! - [`reconcile`]: the periodic loop that persists progress and uploads
//!   finished artifacts
//! - [`store`]: persistence seams with PostgreSQL adapters
//! - [`service`]: queueing and status lookups for callers

pub mod reconcile;
pub mod registry;
pub mod service;
pub mod store;
