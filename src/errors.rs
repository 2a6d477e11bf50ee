// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A list of error types which are produced while running keeps.
use core::fmt::Debug;
use thiserror::Error;

use crate::paillier;

/// The default Result type used in this crate
pub type Result<T> = std::result::Result<T, InternalError>;

/// Represents an error raised anywhere in the client.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum InternalError {
    #[error("Serialization Error")]
    Serialization,
    #[error("Failed to verify proof: `{0}`")]
    FailedToVerifyProof(String),
    #[error("Could not generate proof")]
    CouldNotGenerateProof,
    #[error("Represents some code assumption that was checked at runtime but failed to be true")]
    InternalInvariantFailed,
    #[error("Paillier error: `{0}`")]
    PaillierError(#[from] paillier::Error),
    #[error("Failed to convert integer to k256::Scalar")]
    CouldNotConvertToScalar,
    #[error("Could not invert a Scalar")]
    CouldNotInvertScalar,
    #[error("Could not construct signature from provided scalars")]
    SignatureInstantiationError,
    #[error("This Participant was given a message intended for somebody else")]
    WrongMessageRecipient,
    #[error("Encountered a MessageType which was not expected in this context")]
    MisroutedMessage,
    #[error("Function call contained invalid arguments: `{0}`")]
    InvalidArgument(String),
    #[error("Protocol misbehavior by `{0}`: `{1}`")]
    PeerMisbehaved(String, String),
    #[error("Timed out waiting for `{0}`")]
    Timeout(String),
    #[error("Not enough members are present: `{present}` of `{required}`")]
    InsufficientMembers { present: usize, required: usize },
    #[error("Transport failure: `{0}`")]
    Transport(String),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Host chain call failed: `{0}`")]
    Chain(String),
    #[error("Conflicting public key submitted for keep `{0}`")]
    ConflictingPublicKey(String),
    #[error("Pre-parameters have already been consumed")]
    PreParamsConsumed,
    #[error("Persistence failure: `{0}`")]
    Persistence(String),
    #[error("Could not decrypt stored signer: `{0}`")]
    Decryption(String),
    #[error("No signer registered for keep `{0}`")]
    SignerNotFound(String),
    #[error("Configuration error: `{0}`")]
    Configuration(String),
    #[error("Bitcoin error: `{0}`")]
    Bitcoin(String),
    #[error("Bitcoin relay request failed: `{0}`")]
    Electrs(String),
}

impl InternalError {
    /// Returns `true` for transient network, transient chain and protocol-level
    /// failures; those abort the current attempt but the operation can be
    /// retried until its deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InternalError::Serialization
                | InternalError::FailedToVerifyProof(_)
                | InternalError::PaillierError(_)
                | InternalError::CouldNotConvertToScalar
                | InternalError::CouldNotInvertScalar
                | InternalError::SignatureInstantiationError
                | InternalError::WrongMessageRecipient
                | InternalError::MisroutedMessage
                | InternalError::PeerMisbehaved(_, _)
                | InternalError::Timeout(_)
                | InternalError::InsufficientMembers { .. }
                | InternalError::Transport(_)
                | InternalError::Chain(_)
                | InternalError::Electrs(_)
        )
    }
}

macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).or(Err(crate::errors::InternalError::Serialization))
    }};
}

macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).or(Err(crate::errors::InternalError::Serialization))
    }};
}

macro_rules! verify_err {
    ($x:expr) => {{
        Err(crate::errors::InternalError::FailedToVerifyProof(
            String::from($x),
        ))
    }};
}

macro_rules! arg_err {
    ($x:expr) => {{
        Err(crate::errors::InternalError::InvalidArgument(String::from(
            $x,
        )))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn protocol_and_network_errors_are_retryable() {
        assert!(InternalError::Timeout("ready".into()).is_retryable());
        assert!(InternalError::InsufficientMembers {
            present: 1,
            required: 2
        }
        .is_retryable());
        let failed: Result<()> = verify_err!("bad proof");
        assert!(failed.unwrap_err().is_retryable());
    }

    #[test]
    fn policy_and_persistence_errors_are_fatal() {
        assert!(!InternalError::ConflictingPublicKey("0xkeep".into()).is_retryable());
        assert!(!InternalError::Decryption("tag mismatch".into()).is_retryable());
        assert!(!InternalError::Configuration("bad xpub".into()).is_retryable());
        assert!(!InternalError::Cancelled.is_retryable());
    }
}
