// Copyright 2020 Joyent, Inc.

//! Marshalling abstraction.
//!
//! The runtime only relies on the `Marshaller` contract; codecs are selected
//! by the `serializationType` configuration value.  A JSON marshaller is
//! registered under `json` and used when nothing else is configured.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use serde_derive::{Deserialize, Serialize};

use crate::config::{keys, Config};
use crate::error::{RemotingError, Result};
use crate::invocation::{Callback, InvocationRequest, InvocationResponse, Metadata};

pub const DEFAULT_SERIALIZATION_TYPE: &str = "json";

/// Everything a marshaller may be asked to encode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    Request(InvocationRequest),
    Response(InvocationResponse),
    Callback(Callback),
}

pub trait Marshaller: Send + Sync {
    fn serialization_type(&self) -> &str;

    /// MIME type used by transports that label their bodies.
    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    fn write(&self, message: &WireMessage, sink: &mut BytesMut) -> Result<()>;

    fn read(&self, source: &[u8], metadata: &Metadata) -> Result<WireMessage>;

    /// Deep copy through the wire form, giving in-process calls the value
    /// semantics of a remote call.
    fn copy(&self, message: &WireMessage) -> Result<WireMessage> {
        let mut buf = BytesMut::new();
        self.write(message, &mut buf)?;
        self.read(&buf, &Metadata::new())
    }
}

#[derive(Debug, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn serialization_type(&self) -> &str {
        DEFAULT_SERIALIZATION_TYPE
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    fn write(&self, message: &WireMessage, sink: &mut BytesMut) -> Result<()> {
        // Encode into a scratch buffer so a failure never leaves a partial
        // message in the sink.
        let encoded = serde_json::to_vec(message).map_err(RemotingError::serialization)?;
        sink.put_slice(&encoded);
        Ok(())
    }

    fn read(&self, source: &[u8], _metadata: &Metadata) -> Result<WireMessage> {
        serde_json::from_slice(source).map_err(RemotingError::serialization)
    }
}

/// Marshallers by serialization type.
pub struct MarshalRegistry {
    marshallers: RwLock<HashMap<String, Arc<dyn Marshaller>>>,
}

impl MarshalRegistry {
    pub fn new() -> MarshalRegistry {
        let registry = MarshalRegistry {
            marshallers: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(JsonMarshaller));
        registry
    }

    pub fn register(&self, marshaller: Arc<dyn Marshaller>) {
        let name = marshaller.serialization_type().to_string();
        self.marshallers.write().insert(name, marshaller);
    }

    pub fn get(&self, serialization_type: &str) -> Result<Arc<dyn Marshaller>> {
        self.marshallers
            .read()
            .get(serialization_type)
            .cloned()
            .ok_or_else(|| RemotingError::UnknownSerializationType(serialization_type.to_string()))
    }

    /// The marshaller named by `serializationType`, or the default.
    pub fn for_config(&self, config: &Config) -> Result<Arc<dyn Marshaller>> {
        self.get(
            config
                .get(keys::SERIALIZATION_TYPE)
                .unwrap_or(DEFAULT_SERIALIZATION_TYPE),
        )
    }
}

impl Default for MarshalRegistry {
    fn default() -> MarshalRegistry {
        MarshalRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{Invocation, Payload};

    #[test]
    fn unknown_types_are_configuration_errors() {
        let registry = MarshalRegistry::new();
        let config = Config::new().with(keys::SERIALIZATION_TYPE, "java");
        match registry.for_config(&config) {
            Err(e) => assert!(e.is_configuration()),
            Ok(_) => panic!("expected failure"),
        }
        assert!(registry.for_config(&Config::new()).is_ok());
    }

    #[test]
    fn failed_write_leaves_sink_untouched() {
        let marshaller = JsonMarshaller;
        let mut sink = BytesMut::new();
        let message = WireMessage::Request(InvocationRequest::new(
            "s",
            None,
            Invocation::Payload(Payload::opaque(1u32)),
        ));
        match marshaller.write(&message, &mut sink) {
            Err(RemotingError::Serialization(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sink.is_empty());
    }

    #[test]
    fn copy_produces_equal_value() {
        let message = WireMessage::Callback(Callback::new("event"));
        assert_eq!(JsonMarshaller.copy(&message).unwrap(), message);
    }
}
