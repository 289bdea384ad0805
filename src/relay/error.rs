use std::io;
use thiserror::Error;

use crate::network::Endpoint;

use super::splice::Direction;

/// Failures of a relay session or of one of its connection pairs
///
/// `Bind` and `Accept` end the session. `Connect` and `Copy` only affect the
/// pair they happened on and are reported through logs.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not listen on {endpoint}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("could not accept connections on {endpoint}")]
    Accept {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {endpoint}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("error while copying {direction}")]
    Copy {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Whether this error ends the whole session rather than a single pair
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Bind { .. } | RelayError::Accept { .. })
    }
}
