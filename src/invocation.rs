// Copyright 2020 Joyent, Inc.

//! Invocation requests, responses and callbacks.
//!
//! A request carries one of three invocation shapes: an opaque payload handed
//! straight to the invocation handler, a named method call whose dispatch the
//! handler owns, or an internal invocation consumed by the server invoker
//! itself (pings, listener registration, callback retrieval).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::{Deserialize, Deserializer};
use serde::ser::{self, Serialize, Serializer};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::locator::Locator;

pub type Metadata = BTreeMap<String, Value>;

/// A value moved across an invocation.
///
/// `Value` payloads are representable by every marshaller.  `Opaque` payloads
/// are in-process objects: they can be passed by reference through the local
/// invoker, but any attempt to marshal them fails with a serialization error.
#[derive(Clone)]
pub enum Payload {
    Value(Value),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Payload {
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Payload {
        Payload::Opaque(Arc::new(value))
    }

    pub fn null() -> Payload {
        Payload::Value(Value::Null)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Opaque(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Opaque(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Payload::Opaque(o) => o.downcast_ref::<T>(),
            Payload::Value(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Value(v) => write!(f, "{}", v),
            Payload::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Value(a), Payload::Value(b)) => a == b,
            (Payload::Opaque(a), Payload::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Payload {
        Payload::Value(v)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Payload {
        Payload::Value(Value::String(s.to_string()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Payload {
        Payload::Value(Value::String(s))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Value(v) => v.serialize(serializer),
            Payload::Opaque(_) => Err(ser::Error::custom(
                "payload is an in-process object and cannot be marshalled",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Payload, D::Error> {
        Value::deserialize(deserializer).map(Payload::Value)
    }
}

/// Name-based invocation.  The handler resolves `name` and `signature`
/// against its own dispatch table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub name: String,
    pub params: Vec<Value>,
    #[serde(default)]
    pub signature: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalInvocation {
    Ping {
        lease: bool,
    },
    AddListener {
        listener_id: String,
        callback_locator: Option<Locator>,
        callback_handle: Option<Value>,
    },
    RemoveListener {
        listener_id: String,
    },
    GetCallbacks {
        listener_id: String,
    },
    HandleCallback {
        listener_id: String,
        callback: Callback,
    },
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    Payload(Payload),
    Method(MethodCall),
    Internal(InternalInvocation),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub session_id: String,
    pub subsystem: Option<String>,
    pub invocation: Invocation,
    #[serde(default)]
    pub metadata: Metadata,
}

impl InvocationRequest {
    pub fn new(session_id: &str, subsystem: Option<&str>, invocation: Invocation) -> InvocationRequest {
        InvocationRequest {
            session_id: session_id.to_string(),
            subsystem: subsystem.map(str::to_string),
            invocation,
            metadata: Metadata::new(),
        }
    }

    pub fn internal(session_id: &str, internal: InternalInvocation) -> InvocationRequest {
        InvocationRequest::new(session_id, None, Invocation::Internal(internal))
    }

    /// The opaque payload, if this is a payload invocation.
    pub fn payload(&self) -> Option<&Payload> {
        match &self.invocation {
            Invocation::Payload(p) => Some(p),
            _ => None,
        }
    }
}

/// An error raised by an invocation handler.  It reaches the caller unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationError {
    pub message: String,
    pub detail: Option<Payload>,
}

impl ApplicationError {
    pub fn new<M: Into<String>>(message: M) -> ApplicationError {
        ApplicationError {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail<M: Into<String>>(message: M, detail: Payload) -> ApplicationError {
        ApplicationError {
            message: message.into(),
            detail: Some(detail),
        }
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoHandler,
    Serialization,
    Busy,
    InvalidState,
    Protocol,
    Internal,
}

/// A failure of the remoting layer on the server side, as opposed to an
/// application error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Return(Payload),
    Application(ApplicationError),
    Failure(Failure),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub session_id: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub metadata: Metadata,
}

impl InvocationResponse {
    pub fn new(session_id: &str, outcome: Outcome) -> InvocationResponse {
        InvocationResponse {
            session_id: session_id.to_string(),
            outcome,
            metadata: Metadata::new(),
        }
    }

    pub fn value(session_id: &str, payload: Payload) -> InvocationResponse {
        InvocationResponse::new(session_id, Outcome::Return(payload))
    }

    pub fn failure(session_id: &str, failure: Failure) -> InvocationResponse {
        InvocationResponse::new(session_id, Outcome::Failure(failure))
    }
}

/// An asynchronous notification from a server to a registered listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub payload: Payload,
    /// Correlation token supplied by the client when it registered.
    pub handle: Option<Value>,
    pub server_locator: Option<Locator>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl Callback {
    pub fn new<P: Into<Payload>>(payload: P) -> Callback {
        Callback {
            payload: payload.into(),
            handle: None,
            server_locator: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn opaque_payload_refuses_serialization() {
        let request = InvocationRequest::new(
            "s1",
            Some("test"),
            Invocation::Payload(Payload::opaque(std::sync::Mutex::new(3))),
        );
        assert!(serde_json::to_vec(&request).is_err());
    }

    #[test]
    fn requests_survive_json() {
        let mut request = InvocationRequest::new(
            "s1",
            Some("calc"),
            Invocation::Method(MethodCall {
                name: String::from("add"),
                params: vec![json!(1), json!(2)],
                signature: vec![String::from("i32"), String::from("i32")],
            }),
        );
        request.metadata.insert(String::from("trace"), json!("abc"));
        let bytes = serde_json::to_vec(&request).unwrap();
        let back: InvocationRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn opaque_payloads_compare_by_identity() {
        let a = Payload::opaque(5u8);
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Payload::opaque(5u8));
        assert_eq!(a.downcast_ref::<u8>(), Some(&5));
    }
}
