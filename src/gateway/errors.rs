// src/gateway/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors raised by a broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] LapinError),

    #[error("{0} is closed")]
    Closed(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("connection setup failed while {stage}: {source}")]
    ConnectionError {
        stage: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("publish error: {0}")]
    PublishError(#[source] BrokerError),

    #[error("consume error: {0}")]
    ConsumeError(#[source] BrokerError),

    #[error("teardown error while {stage}: {source}")]
    TeardownError {
        stage: &'static str,
        #[source]
        source: BrokerError,
    },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub(crate) fn setup(stage: &'static str) -> impl FnOnce(BrokerError) -> Self {
        move |source| GatewayError::ConnectionError { stage, source }
    }

    pub(crate) fn teardown(stage: &'static str) -> impl FnOnce(BrokerError) -> Self {
        move |source| GatewayError::TeardownError { stage, source }
    }
}

impl From<SerdeError> for GatewayError {
    fn from(error: SerdeError) -> Self {
        GatewayError::InvalidConfiguration(format!("malformed settings: {}", error))
    }
}

impl From<std::env::VarError> for GatewayError {
    fn from(err: std::env::VarError) -> Self {
        GatewayError::InvalidConfiguration(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for GatewayError {
    fn from(err: std::num::ParseIntError) -> Self {
        GatewayError::InvalidConfiguration(format!("Parse error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::InvalidConfiguration(format!("I/O error: {}", err))
    }
}
