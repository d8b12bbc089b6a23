/// Errors raised while persisting tracking events.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("tracking database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("tracking pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("tracking serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
