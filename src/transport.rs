//! Message hub transport.
//!
//! The relay only depends on the [`Transport`] contract; [`ModuleClient`] is
//! the MQTT implementation talking to the IoT Edge hub.

pub mod connection_string;
pub mod mqtt;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

pub use connection_string::ConnectionString;
pub use mqtt::{ModuleClient, ModuleSettings};

/// A message exchanged with the hub. The payload is opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    /// Application properties.
    pub properties: BTreeMap<String, String>,
    pub system: SystemProperties,
}

impl Message {
    pub fn new<P: Into<Vec<u8>>>(payload: P) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Hub-defined properties carried next to the application ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// Acknowledgement of an inbound message, telling the hub whether to redeliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Rejected,
    Abandoned,
}

/// Whether a twin update carries the whole desired document or a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateState {
    Complete,
    Partial,
}

impl fmt::Display for TwinUpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TwinUpdateState::Complete => write!(f, "COMPLETE"),
            TwinUpdateState::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// Called for every message arriving on the input it is registered for.
pub type InputHandler = Arc<dyn Fn(Message) -> Disposition + Send + Sync>;

/// Called with the desired properties JSON on every twin update.
pub type TwinHandler = Arc<dyn Fn(TwinUpdateState, &str) + Send + Sync>;

/// Resolves once the hub has acknowledged a sent message.
pub type DeliveryFuture = BoxFuture<'static, Result<(), Error>>;

/// A session with the message hub.
///
/// Handlers run on the transport's own task, concurrently with whoever sends,
/// and must return quickly.
pub trait Transport: Send + Sync + 'static {
    /// Queue `message` on the named output.
    ///
    /// Returns immediately; the future reports the outcome. Sends to the same
    /// output are not ordered relative to each other.
    fn send_event(&self, output: &str, message: Message) -> DeliveryFuture;

    /// Register the handler for an input, replacing any previous one.
    /// Messages on inputs without a handler are dropped.
    fn set_input_handler(&self, input: &str, handler: InputHandler);

    /// Register the twin handler, replacing any previous one.
    fn set_twin_handler(&self, handler: TwinHandler);
}

/// Writes propagated trace context into a message's application properties.
pub struct PropertyInjector<'a>(pub &'a mut BTreeMap<String, String>);

impl<'a> opentelemetry::propagation::Injector for PropertyInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("create MQTT client: {0}")]
    CreateMqttClient(#[from] paho_mqtt::Error),

    #[error("connect to the hub: {0}")]
    Connection(#[source] paho_mqtt::Error),

    #[error("invalid connection string: {0}")]
    ConnectionString(String),

    #[error("deliver message: {0}")]
    Delivery(String),
}
