//! Rate-limited clients for the external services Reelforge talks to.
//!
//! Everything that leaves the process goes through this crate: the planning
//! database (hard 3 req/s process-wide ceiling), the upload API (quota
//! ledger is reserved by the caller before any billable call), OAuth token
//! refresh, and the alert webhook. Retry classification lives here too so
//! every client applies the same rules.

pub mod alert;
pub mod error;
pub mod oauth;
pub mod planning;
pub mod rate_limit;
pub mod retry;
pub mod upload;

pub use alert::{AlertSink, WebhookAlertSink};
pub use error::ClientError;
pub use oauth::{OauthCache, OauthConfig};
pub use planning::{HttpPlanningClient, PageStatus, PlanningApi};
pub use rate_limit::RateGate;
pub use retry::{backoff_delay, retry_request, MAX_ATTEMPTS};
pub use upload::{
    HttpUploadClient, UploadMeta, Uploader, VideoRef, DEFAULT_DAILY_CEILING, UPLOAD_COST_UNITS,
};
