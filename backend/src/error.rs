use thiserror::Error;

use scheduler::AdmissionError;

/// The core's error surface. Admission rejections and deadline misses reach
/// callers; everything else is either absorbed (fallbacks, outbox, retries)
/// or fatal.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("tenant queue is full")]
    QueueFull { retry_after_ms: u64 },

    #[error("quota exceeded")]
    QuotaExceeded { retry_after_ms: u64 },

    #[error("tenant is not active")]
    TenantInactive,

    #[error("region not allowed for tenant")]
    RegionForbidden,

    #[error("tenant session bind failed: {0}")]
    TenantBind(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl CoreError {
    /// Status the HTTP edge maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::QueueFull { .. } | CoreError::QuotaExceeded { .. } => 429,
            CoreError::TenantInactive | CoreError::RegionForbidden | CoreError::TenantBind(_) => {
                403
            }
            CoreError::DownstreamUnavailable(_) => 503,
            CoreError::DeadlineExceeded => 504,
            CoreError::InternalInvariantViolation(_) => 500,
        }
    }

    /// Machine-readable rejection code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::QueueFull { .. } => "QUEUE_FULL",
            CoreError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            CoreError::TenantInactive => "TENANT_INACTIVE",
            CoreError::RegionForbidden => "REGION_FORBIDDEN",
            CoreError::TenantBind(_) => "TENANT_BIND_ERROR",
            CoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            CoreError::DownstreamUnavailable(_) => "DOWNSTREAM_UNAVAILABLE",
            CoreError::InternalInvariantViolation(_) => "INTERNAL_INVARIANT_VIOLATION",
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            CoreError::QueueFull { retry_after_ms }
            | CoreError::QuotaExceeded { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<AdmissionError> for CoreError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::QueueFull { retry_after_ms } => CoreError::QueueFull { retry_after_ms },
            AdmissionError::QuotaExceeded { retry_after_ms, .. } => {
                CoreError::QuotaExceeded { retry_after_ms }
            }
            AdmissionError::TenantInactive => CoreError::TenantInactive,
            AdmissionError::RegionForbidden => CoreError::RegionForbidden,
            AdmissionError::TenantBind(msg) => CoreError::TenantBind(msg),
            AdmissionError::DownstreamUnavailable(msg) => CoreError::DownstreamUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_status_mapping() {
        assert_eq!(CoreError::QueueFull { retry_after_ms: 100 }.http_status(), 429);
        assert_eq!(CoreError::QuotaExceeded { retry_after_ms: 100 }.http_status(), 429);
        assert_eq!(CoreError::TenantInactive.http_status(), 403);
        assert_eq!(CoreError::RegionForbidden.http_status(), 403);
        assert_eq!(CoreError::DownstreamUnavailable("x".into()).http_status(), 503);
        assert_eq!(CoreError::DeadlineExceeded.http_status(), 504);
    }

    #[test]
    fn retry_hint_only_where_meaningful() {
        assert_eq!(
            CoreError::QueueFull { retry_after_ms: 250 }.retry_after_ms(),
            Some(250)
        );
        assert_eq!(CoreError::TenantInactive.retry_after_ms(), None);
    }
}
