use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// Binding `app.tenant_id` on the database session failed. Reads must not
    /// proceed without the binding, so callers fail closed on this.
    #[error("tenant session bind failed: {0}")]
    TenantBind(String),

    #[error("registry storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid tenant row: {0}")]
    InvalidRow(String),
}
