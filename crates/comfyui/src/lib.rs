//! ComfyUI compute backend integration.
//!
//! Provides typed message parsing, the WebSocket and REST clients, the
//! [`backend::ComputeBackend`] seam, per-preset job description builders,
//! and the [`handle::JobHandle`] state machine that drives one job from
//! submission to a terminal state.

pub mod api;
pub mod backend;
pub mod client;
pub mod handle;
pub mod history;
pub mod messages;
pub mod tracker;
pub mod workflow;
