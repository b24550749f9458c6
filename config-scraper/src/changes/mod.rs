//! Change deduplication and rate limiting.

pub mod fingerprint;
pub mod rate_limit;

pub use fingerprint::{ChangeFingerprintCache, RecordedChange};
pub use rate_limit::{
    ChangeRateLimiter, DEFAULT_CHANGE_WINDOW, DEFAULT_MAX_CHANGES, RateDecision, TOO_MANY_CHANGES,
};
