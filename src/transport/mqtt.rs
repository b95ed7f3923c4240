//! MQTT session with the IoT Edge hub.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use paho_mqtt::async_client::AsyncClient as MqttClient;
use paho_mqtt::{
    ConnectOptions, ConnectOptionsBuilder, CreateOptionsBuilder, Message as MqttMessage,
    MessageBuilder as MqttMessageBuilder, SslOptionsBuilder,
};
use url::form_urlencoded;

use super::connection_string::url_encode;
use super::{
    ConnectionString, DeliveryFuture, Disposition, Error, InputHandler, Message, SystemProperties,
    Transport, TwinHandler, TwinUpdateState,
};

const MQTT_TLS_PORT: u16 = 8883;
const INBOUND_BUFFER: usize = 64;
const SUBSCRIPTION_QOS: [i32; 3] = [1, 0, 0];
const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Everything needed to open a module session.
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub connection_string: ConnectionString,
    /// CA bundle the edge hub's certificate chains to.
    pub ca_certificate: Option<PathBuf>,
    pub keep_alive: Duration,
    /// How long a send may wait for the hub's acknowledgement.
    pub message_timeout: Duration,
    pub sas_token_ttl: Duration,
}

impl ModuleSettings {
    /// The MQTT password for a connection attempt made at `now`.
    fn password(&self, now: DateTime<Utc>) -> Result<String, Error> {
        self.connection_string.password(now, self.sas_token_ttl)
    }
}

/// The module's session with the edge hub.
pub struct ModuleClient {
    session: Arc<Session>,
    router: Arc<Router>,
}

impl ModuleClient {
    /// Open the session and start dispatching inbound traffic.
    ///
    /// Handlers may be registered afterwards; traffic arriving before that is
    /// dropped, and the full twin is fetched when the twin handler is set.
    /// A dropped connection is reopened with a freshly signed password and the
    /// full twin is fetched again.
    #[tracing::instrument(skip(settings), fields(module = %settings.connection_string.client_id()), err)]
    pub async fn connect(settings: ModuleSettings) -> Result<ModuleClient, Error> {
        let connection_string = &settings.connection_string;
        let server_uri = format!("ssl://{}:{}", connection_string.broker_host(), MQTT_TLS_PORT);

        let mut client = MqttClient::new(
            CreateOptionsBuilder::new()
                .server_uri(&server_uri)
                .client_id(connection_string.client_id())
                .finalize(),
        )?;
        let stream = client.get_stream(INBOUND_BUFFER);

        let router = Arc::new(Router::new(
            &connection_string.device_id,
            &connection_string.module_id,
        ));
        let session = Arc::new(Session {
            client,
            subscriptions: [
                router.topics.inputs_filter(),
                TWIN_RESPONSE_FILTER.to_string(),
                TWIN_PATCH_FILTER.to_string(),
            ],
            settings,
            twin_request_id: AtomicU64::new(1),
        });

        tracing::info!(server_uri, "connect to the edge hub");
        if let Err(e) = session.open().await {
            tracing::error!(error = ?e, "failed to connect to the edge hub");
            return Err(e);
        }

        tokio::spawn(dispatch(stream, router.clone(), session.clone()));

        Ok(ModuleClient { session, router })
    }
}

impl Transport for ModuleClient {
    #[tracing::instrument(skip(self, message), fields(size = message.payload.len()))]
    fn send_event(&self, output: &str, message: Message) -> DeliveryFuture {
        let topic = self.router.topics.event(output, &message);
        let mqtt_message = MqttMessageBuilder::new()
            .topic(topic)
            .payload(message.payload)
            .qos(1)
            .finalize();

        tracing::debug!(?mqtt_message, "publishing to the edge hub");
        let token = self.session.client.publish(mqtt_message);
        let timeout = self.session.settings.message_timeout;

        let delivery: DeliveryFuture = Box::pin(async move {
            match tokio::time::timeout(timeout, token).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Delivery(e.to_string())),
                Err(_) => Err(Error::Delivery(format!(
                    "not acknowledged within {}ms",
                    timeout.as_millis()
                ))),
            }
        });
        delivery
    }

    fn set_input_handler(&self, input: &str, handler: InputHandler) {
        self.router.set_input_handler(input, handler);
        tracing::info!(input, "waiting for messages");
    }

    fn set_twin_handler(&self, handler: TwinHandler) {
        self.router.set_twin_handler(handler);
        tracing::info!("waiting for module twin updates");
        self.session.request_twin();
    }
}

impl Debug for ModuleClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClient")
            .field("topics", &self.router.topics)
            .field("message_timeout", &self.session.settings.message_timeout)
            .finish()
    }
}

/// What the dispatch loop needs from the session when the connection drops.
trait Link: Send + Sync + 'static {
    /// Resolves once the session is open again.
    fn reconnect(&self) -> BoxFuture<'_, ()>;

    fn request_twin(&self);
}

/// The paho client together with what it takes to (re)open the session.
struct Session {
    client: MqttClient,
    settings: ModuleSettings,
    subscriptions: [String; 3],
    twin_request_id: AtomicU64,
}

impl Session {
    /// Connect options with a password signed at `now`.
    fn connect_options(&self, now: DateTime<Utc>) -> Result<ConnectOptions, Error> {
        let mut ssl_options = SslOptionsBuilder::new();
        if let Some(ca_certificate) = &self.settings.ca_certificate {
            ssl_options.trust_store(ca_certificate.clone())?;
        }

        Ok(ConnectOptionsBuilder::with_mqtt_version(paho_mqtt::MQTT_VERSION_3_1_1)
            .keep_alive_interval(self.settings.keep_alive)
            .clean_session(false)
            .user_name(self.settings.connection_string.user_name())
            .password(self.settings.password(now)?)
            .ssl_options(ssl_options.finalize())
            .finalize())
    }

    async fn open(&self) -> Result<(), Error> {
        let connect_options = self.connect_options(Utc::now())?;
        match self.client.connect(connect_options).await {
            Ok(connection_info) => {
                tracing::info!(info = ?connection_info, "connected to the edge hub")
            }
            Err(e) => return Err(Error::Connection(e)),
        }

        self.client
            .subscribe_many(&self.subscriptions, &SUBSCRIPTION_QOS)
            .await
            .map_err(Error::Connection)?;
        Ok(())
    }
}

impl Link for Session {
    fn reconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                tokio::time::sleep(reconnect_delay(attempt)).await;
                match self.open().await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "failed to reconnect to the edge hub");
                        attempt += 1;
                    }
                }
            }
        })
    }

    fn request_twin(&self) {
        let request_id = self.twin_request_id.fetch_add(1, Ordering::Relaxed);
        let request = MqttMessageBuilder::new()
            .topic(format!("$iothub/twin/GET/?$rid={request_id}"))
            .payload(Vec::new())
            .qos(0)
            .finalize();

        tracing::debug!(request_id, "requesting the module twin");
        let token = self.client.publish(request);
        tokio::spawn(async move {
            if let Err(e) = token.await {
                tracing::warn!(error = %e, "failed to request the module twin");
            }
        });
    }
}

/// Pause before reconnect attempt `attempt`, doubling up to a minute.
fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_MIN_DELAY
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(RECONNECT_MAX_DELAY, |delay| delay.min(RECONNECT_MAX_DELAY))
}

async fn dispatch<S, L>(stream: S, router: Arc<Router>, link: Arc<L>)
where
    S: Stream<Item = Option<MqttMessage>>,
    L: Link,
{
    let mut stream = Box::pin(stream);
    while let Some(next) = stream.next().await {
        match next {
            Some(message) => router.route(message.topic(), message.payload()),
            None => {
                tracing::warn!("lost the edge hub connection; reconnecting");
                link.reconnect().await;
                tracing::info!("reconnected to the edge hub");
                // patches published while offline are gone
                link.request_twin();
            }
        }
    }

    tracing::info!("inbound stream closed");
}

/// Topic layout of one module.
#[derive(Debug, Clone)]
struct ModuleTopics {
    prefix: String,
}

impl ModuleTopics {
    fn new(device_id: &str, module_id: &str) -> Self {
        ModuleTopics {
            prefix: format!("devices/{device_id}/modules/{module_id}"),
        }
    }

    fn inputs_filter(&self) -> String {
        format!("{}/inputs/#", self.prefix)
    }

    /// Topic for sending `message` on `output`, with its property bag.
    fn event(&self, output: &str, message: &Message) -> String {
        let mut bag = vec![format!("$.on={}", url_encode(output))];

        let SystemProperties {
            message_id,
            correlation_id,
            content_type,
            content_encoding,
        } = &message.system;
        for (key, value) in [
            ("$.mid", message_id),
            ("$.cid", correlation_id),
            ("$.ct", content_type),
            ("$.ce", content_encoding),
        ] {
            if let Some(value) = value {
                bag.push(format!("{key}={}", url_encode(value)));
            }
        }

        for (key, value) in &message.properties {
            bag.push(format!("{}={}", url_encode(key), url_encode(value)));
        }

        format!("{}/messages/events/{}", self.prefix, bag.join("&"))
    }

    /// Split an inbound topic into input name and property bag.
    fn parse_input<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/inputs/")?;

        Some(rest.split_once('/').unwrap_or((rest, "")))
    }
}

fn decode_message(payload: &[u8], property_bag: &str) -> Message {
    let mut message = Message::new(payload);

    for (key, value) in form_urlencoded::parse(property_bag.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "$.mid" => message.system.message_id = Some(value),
            "$.cid" => message.system.correlation_id = Some(value),
            "$.ct" => message.system.content_type = Some(value),
            "$.ce" => message.system.content_encoding = Some(value),
            // routing details added by the hub, not part of the message
            hub if hub.starts_with("$.") => {}
            _ => {
                message.properties.insert(key.to_string(), value);
            }
        }
    }

    message
}

/// Extract the `desired` section of a full twin document.
fn desired_section(twin: &[u8]) -> Option<String> {
    let document: serde_json::Value = serde_json::from_slice(twin).ok()?;
    document.get("desired").map(|desired| desired.to_string())
}

/// Hands inbound publications to the registered handlers.
struct Router {
    topics: ModuleTopics,
    inputs: RwLock<HashMap<String, InputHandler>>,
    twin: RwLock<Option<TwinHandler>>,
}

impl Router {
    fn new(device_id: &str, module_id: &str) -> Self {
        Router {
            topics: ModuleTopics::new(device_id, module_id),
            inputs: RwLock::new(HashMap::new()),
            twin: RwLock::new(None),
        }
    }

    fn set_input_handler(&self, input: &str, handler: InputHandler) {
        self.inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(input.to_string(), handler);
    }

    fn set_twin_handler(&self, handler: TwinHandler) {
        *self.twin.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        if let Some((input, property_bag)) = self.topics.parse_input(topic) {
            self.deliver_input(input, decode_message(payload, property_bag));
        } else if topic.starts_with(TWIN_PATCH_PREFIX) {
            match std::str::from_utf8(payload) {
                Ok(patch) => self.deliver_twin(TwinUpdateState::Partial, patch),
                Err(e) => tracing::warn!(error = %e, "twin patch is not UTF-8"),
            }
        } else if let Some(response) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
            let status = response.split('/').next().unwrap_or_default();
            if status != "200" {
                tracing::warn!(status, "twin request failed");
                return;
            }
            match desired_section(payload) {
                Some(desired) => self.deliver_twin(TwinUpdateState::Complete, &desired),
                None => tracing::warn!("twin response has no desired properties"),
            }
        } else {
            tracing::debug!(topic, "ignoring message on unknown topic");
        }
    }

    fn deliver_input(&self, input: &str, message: Message) {
        let handler = self
            .inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(input)
            .cloned();
        let Some(handler) = handler else {
            tracing::debug!(input, "dropping message on input without handler");
            return;
        };

        match handler(message) {
            Disposition::Accepted => {}
            // MQTT acknowledges on receipt; there is no way to hand it back
            disposition => tracing::warn!(input, ?disposition, "disposition not supported over MQTT"),
        }
    }

    fn deliver_twin(&self, state: TwinUpdateState, desired: &str) {
        let handler = self
            .twin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(state, desired),
            None => tracing::debug!(%state, "dropping twin update without handler"),
        }
    }
}
