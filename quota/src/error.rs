use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QuotaError {
    /// The counter store could not be reached and the fail policy for the
    /// request's priority says to refuse rather than wave through.
    #[error("quota store unavailable: {0}")]
    StoreUnavailable(String),

    /// A commit arrived for a reservation the engine never issued. This is an
    /// invariant violation; callers treat it as fatal.
    #[error("commit without a matching reserve: {0}")]
    CommitWithoutReserve(Uuid),

    #[error("quota storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
