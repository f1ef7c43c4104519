use derive_more::From;

use crate::{server::ServerError, store::LoadError};

// -- Errors

/// Fatal failures of [`crate::launch`]; the process should exit non-zero.
#[derive(Debug, From)]
pub enum StartupError {
    Load(LoadError),
    Server(ServerError),
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::Server(err) => Some(err),
        }
    }
}

impl core::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "could not load test cases: {err}"),
            Self::Server(err) => write!(f, "could not start server: {err}"),
        }
    }
}
