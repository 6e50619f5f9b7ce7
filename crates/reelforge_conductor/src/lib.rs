//! Reelforge conductor: the orchestration core.
//!
//! Turns planning rows into published videos across many channels. The
//! dispatcher claims tasks from the durable queue with fair cross-channel
//! ordering, the engine drives each task through the eight pipeline stages
//! (invoking the external programs through the supervisor and the external
//! APIs through the rate-limited clients), the reconciler keeps the planning
//! database mirror consistent, and the HTTP surface carries health, review
//! decisions and manual retries.

pub mod config;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod stages;
pub mod sync;

pub use config::Config;
pub use context::AppContext;
