//! The session-manager public boundary's typed error kind. Internal,
//! driver-facing code keeps using `anyhow::Result` with `.context(...)`
//! exactly as the rest of this crate's frontend layer does; this enum only
//! exists at the eight control-API operations so a host can distinguish
//! "you gave me garbage" from "the session is gone" from "the driver blew
//! up".

use crate::model::SessionHandle;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("missing or invalid field: {0}")]
    BadInput(String),

    #[error("session {0} not found")]
    NotFound(SessionHandle),

    #[error("frontend {0} does not support spectrum acquisition")]
    UnsupportedDriver(String),

    #[error("frontend descriptor unavailable")]
    ResourceUnavailable,

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

pub type ScanResult<T> = Result<T, ScanError>;
