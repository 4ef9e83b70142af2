//! Error type shared by the node's fallible operations.

use thiserror::Error;

/// Errors surfaced by map handling, message decoding and configuration.
///
/// Infeasible bids and unreachable quorum are not errors: they are modelled as
/// `BidValue::Invalid` and a Pending auction session respectively.
#[derive(Error, Debug)]
pub enum Error {
    #[error("goal area not fully discovered yet")]
    UndiscoveredGoal,

    #[error("malformed map message: {0}")]
    MalformedMapMessage(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
