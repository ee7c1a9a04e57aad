use std::{path::PathBuf, time::Duration};

/// Everything that can go wrong during one authorization attempt.
///
/// None of these escape [`crate::Authenticator::authenticate`]; the
/// orchestrator folds them into a [`crate::FlowOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("discovery failed: {message}")]
    Discovery { message: String },

    #[error("failed to bind callback listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid callback: {message}")]
    CallbackValidation { message: String },

    #[error("token exchange failed: {message}")]
    Exchange { message: String },

    #[error("token cache {path} is not accessible: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no authorization callback received within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::CallbackValidation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn exchange(message: impl Into<String>) -> Self {
        Self::Exchange {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
