use ::uuid::Uuid;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod token;
use token::ContextToken;

pub mod broker;

pub mod handler;

mod context;
pub use context::Cancellation;

mod unit;

/// An opaque blob of bytes handed between the host and a method body.
///
/// The broker never looks inside a payload, it only stores it and hands
/// back exactly what it was given.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new() -> Self {
        Payload(vec![])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }
}
impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload(bytes.to_vec())
    }
}
impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload(s.as_bytes().to_vec())
    }
}
impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload(s.into_bytes())
    }
}
impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Most payloads in practice are short strings so it's much nicer to
        // see them as text in logs when that's possible
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Payload({:?})", s),
            Err(_) => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

#[test]
fn payload_debug() {
    assert_eq!(format!("{:?}", Payload::from("ping")), "Payload(\"ping\")");
    assert_eq!(format!("{:?}", Payload::from(vec![0xff, 0xfe])), "Payload(2 bytes)");
}

/// The input to a single method invocation
///
/// `method` identifies which method body should run and `arguments` is
/// passed through to it untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParameters {
    pub method: Uuid,
    pub arguments: Payload,
}

impl StartParameters {
    pub fn new(method: Uuid, arguments: impl Into<Payload>) -> Self {
        StartParameters {
            method,
            arguments: arguments.into(),
        }
    }
}

#[test]
fn start_parameters_serde() {
    let method = Uuid::from_u128(0x5e7a_2c1f_0000_4000_8000_0000_0000_0001);
    let parameters = StartParameters::new(method, vec![0u8, 1, 0xff]);

    let json = serde_json::to_string(&parameters).unwrap();
    assert_eq!(json,
               r#"{"method":"5e7a2c1f-0000-4000-8000-000000000001","arguments":[0,1,255]}"#);
    let parsed: StartParameters = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, parameters);
}

/// Failures that happen inside a method body.
///
/// These never escape the worker running the method. They are recorded
/// as the status of the invocation and handed back by `end()`.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MethodError {
    #[error("No handler registered for method {0}")]
    UnknownMethod(Uuid),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Aborted")]
    Aborted,

    #[error("Method panicked: {0}")]
    Panicked(String),

    #[error("Method failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodStatus {
    Succeeded,
    Failed(MethodError),
}

impl MethodStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, MethodStatus::Succeeded)
    }
}

/// The status and results of a finished invocation, as returned by `end()`
///
/// `results` is only `Some` when the method succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub status: MethodStatus,
    pub results: Option<Payload>,
}

impl Completion {
    pub(crate) fn succeeded(results: Payload) -> Self {
        Completion {
            status: MethodStatus::Succeeded,
            results: Some(results),
        }
    }

    pub(crate) fn failed(error: MethodError) -> Self {
        Completion {
            status: MethodStatus::Failed(error),
            results: None,
        }
    }

    pub fn into_result(self) -> std::result::Result<Payload, MethodError> {
        match self.status {
            MethodStatus::Succeeded => Ok(self.results.unwrap_or_default()),
            MethodStatus::Failed(err) => Err(err),
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// The method body for `token` has finished and its results are
    /// waiting to be picked up with `end()`.
    #[non_exhaustive]
    MethodCompleted {
        token: ContextToken,
        succeeded: bool,
    },

    /// `cancel()` was called for `token` and the invocation is no longer
    /// reachable.
    #[non_exhaustive]
    MethodCancelled {
        token: ContextToken,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to initialize method invocation: {0}")]
    Initialization(String),

    #[error("Unknown or already consumed method context {0}")]
    InvalidContext(ContextToken),

    #[error("Timed out waiting for method to complete")]
    Timeout,

    #[error("A handler is already registered for method {0}")]
    DuplicateMethod(Uuid),
}

pub type Result<T> = std::result::Result<T, Error>;
