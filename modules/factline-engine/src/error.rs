use factline_events::Event;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EsdbError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("setup error: {0}")]
    Setup(String),

    /// The event was durably handled but a pipeline phase recorded a
    /// failure. The finalized event carries the per-phase/per-entity error
    /// map so callers can tell what went wrong where.
    #[error("event {} was not applied", .0.v)]
    EventFailed(Box<Event>),

    #[error("no stored event for version {0}")]
    MissingEvent(i64),

    #[error("engine stopped before the awaited version was handled")]
    Stopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EsdbError>;
