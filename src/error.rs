use crate::records::TicketId;
use axum::http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

pub type TimelineResult<T> = Result<T, TimelineError>;

/// Errors of the service layer. The assembly pipeline itself never fails.
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown ticket: {0}")]
    UnknownTicket(TicketId),
    #[error("record belongs to ticket {found}, expected {expected}")]
    TicketMismatch { expected: TicketId, found: TicketId },
    #[error("snapshot file name is not a ticket id: {}", .0.display())]
    InvalidSnapshotName(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TimelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TimelineError::UnknownTicket(_) => StatusCode::NOT_FOUND,
            TimelineError::TicketMismatch { .. } | TimelineError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            TimelineError::Io(_)
            | TimelineError::InvalidSnapshotName(_)
            | TimelineError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TimelineError> for StatusCode {
    fn from(err: TimelineError) -> Self {
        err.status_code()
    }
}
