//! Mapping of admission decisions onto the standard rate limit header set.
//!
//! Pure functions only: the surrounding HTTP framework attaches the headers
//! and picks the status code, this module just computes them.

use chrono::Utc;
use serde::Serialize;

use super::key::RateLimitKey;
use super::limiter::Decision;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Error code carried in the 429 body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Compute the header set for a decision at the current wall clock.
///
/// Attached to every response, admitted or not.
pub fn headers(decision: &Decision) -> Vec<(&'static str, String)> {
    headers_at(decision, Utc::now().timestamp())
}

/// Compute the header set for a decision at a given epoch second.
///
/// `X-RateLimit-Remaining` is emitted unclamped, negative values included.
/// `Retry-After` appears only once the caller is over budget.
pub fn headers_at(decision: &Decision, now_epoch_secs: i64) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (LIMIT_HEADER, decision.limit.to_string()),
        (REMAINING_HEADER, decision.remaining.to_string()),
        (
            RESET_HEADER,
            (now_epoch_secs + decision.reset_seconds as i64).to_string(),
        ),
    ];
    if decision.remaining < 0 {
        headers.push((RETRY_AFTER_HEADER, decision.reset_seconds.to_string()));
    }
    headers
}

/// Structured body for a 429 response.
#[derive(Debug, Clone, Serialize)]
pub struct RejectBody {
    pub code: &'static str,
    pub limit: u32,
    pub window: u64,
    pub key: String,
}

impl RejectBody {
    pub fn new(decision: &Decision, window_seconds: u64, key: &RateLimitKey) -> Self {
        Self {
            code: RATE_LIMIT_EXCEEDED,
            limit: decision.limit,
            window: window_seconds,
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::{Identity, KeyResolver};

    fn decision(is_limited: bool, remaining: i64) -> Decision {
        Decision {
            is_limited,
            limit: 100,
            remaining,
            reset_seconds: 30,
        }
    }

    #[test]
    fn test_headers_for_admitted_request() {
        let headers = headers_at(&decision(false, 40), 1_000);

        assert_eq!(
            headers,
            vec![
                (LIMIT_HEADER, "100".to_string()),
                (REMAINING_HEADER, "40".to_string()),
                (RESET_HEADER, "1030".to_string()),
            ]
        );
    }

    #[test]
    fn test_retry_after_only_when_over_budget() {
        let headers = headers_at(&decision(true, -3), 1_000);

        assert_eq!(headers.len(), 4);
        assert_eq!(headers[1], (REMAINING_HEADER, "-3".to_string()));
        assert_eq!(headers[3], (RETRY_AFTER_HEADER, "30".to_string()));
    }

    #[test]
    fn test_remaining_zero_has_no_retry_after() {
        // remaining == 0 is at the limit but the request was admitted
        let headers = headers_at(&decision(false, 0), 1_000);
        assert!(headers.iter().all(|(name, _)| *name != RETRY_AFTER_HEADER));
    }

    #[test]
    fn test_reject_body() {
        let key = KeyResolver::new("rl:").resolve(&Identity::principal("42"));
        let body = RejectBody::new(&decision(true, -1), 60, &key);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "code": "RATE_LIMIT_EXCEEDED",
                "limit": 100,
                "window": 60,
                "key": "rl:user:42",
            })
        );
    }
}
