//! The telemetry relay: publishes sensor readings on a cycle, forwards
//! inbound messages and follows the twin's telemetry cycle.

mod state;


use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use opentelemetry::global::get_text_map_propagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::codec;
use crate::sensor::{self, SensorReader};
use crate::transport::{
    DeliveryFuture, Disposition, InputHandler, Message, PropertyInjector, Transport, TwinHandler,
    TwinUpdateState,
};

pub use state::{Cadence, CountersSnapshot, DeliveryCounters, DEFAULT_TELEMETRY_CYCLE_MS};

/// Names of the module's input and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    /// Input whose messages are forwarded.
    pub input: String,
    /// Output the forwarded messages go to.
    pub forward_output: String,
    /// Output carrying the telemetry documents.
    pub sensor_output: String,
}

impl Default for Routes {
    fn default() -> Self {
        Routes {
            input: "input1".to_string(),
            forward_output: "output1".to_string(),
            sensor_output: "output2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Starting,
    Running,
    Stopped,
}

/// Owns the send, receive and reconfigure lifecycle of the module.
pub struct RelayLoop<T, S> {
    transport: Arc<T>,
    sensor: S,
    routes: Routes,
    cadence: Arc<Cadence>,
    counters: Arc<DeliveryCounters>,
    state: RelayState,
    /// Mirrors `state == Running` for the inbound handler.
    running: Arc<AtomicBool>,
}

impl<T: Transport, S: SensorReader> RelayLoop<T, S> {
    pub fn new(transport: Arc<T>, sensor: S, routes: Routes, cadence: Arc<Cadence>) -> Self {
        RelayLoop {
            transport,
            sensor,
            routes,
            cadence,
            counters: Arc::new(DeliveryCounters::new()),
            state: RelayState::Starting,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn cadence(&self) -> Arc<Cadence> {
        self.cadence.clone()
    }

    pub fn counters(&self) -> Arc<DeliveryCounters> {
        self.counters.clone()
    }

    /// How long the loop pauses after the current tick.
    pub fn next_sleep(&self) -> Duration {
        self.cadence.interval()
    }

    /// Register the inbound and twin handlers with the transport.
    pub fn start(&mut self) {
        if self.state != RelayState::Starting {
            return;
        }

        self.transport.set_input_handler(
            &self.routes.input,
            forward_handler(
                Arc::downgrade(&self.transport),
                self.routes.forward_output.clone(),
                self.counters.clone(),
                self.running.clone(),
            ),
        );
        self.transport
            .set_twin_handler(twin_handler(self.cadence.clone()));

        tracing::info!(
            input = %self.routes.input,
            telemetry_cycle_ms = self.cadence.interval_ms(),
            "relay running"
        );
        self.state = RelayState::Running;
        self.running.store(true, Ordering::Release);
    }

    /// Stop for good; inbound messages are no longer forwarded.
    fn stop(&mut self) {
        self.state = RelayState::Stopped;
        self.running.store(false, Ordering::Release);
    }

    /// Publish one reading.
    ///
    /// Returns the sent total, or `None` when the reading could not be
    /// encoded and was dropped. A sensor failure stops the relay.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the hub's confirmation is
    /// awaited on a spawned task.
    #[tracing::instrument(skip(self), err)]
    pub fn tick(&mut self) -> Result<Option<u64>, Error> {
        let snapshot = match self.sensor.capture() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        };

        let payload = match codec::encode(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable reading");
                return Ok(None);
            }
        };
        tracing::info!(%payload, "sending telemetry");

        let mut message = Message::new(payload);
        message.system.message_id = Some(uuid::Uuid::now_v7().to_string());
        message.system.content_type = Some("application/json".to_string());
        message.system.content_encoding = Some("utf-8".to_string());

        // tracing information
        let ctx = tracing::Span::current().context();
        get_text_map_propagator(|propagator| {
            propagator.inject_context(&ctx, &mut PropertyInjector(&mut message.properties))
        });

        let delivery = self
            .transport
            .send_event(&self.routes.sensor_output, message);
        let sent = self.counters.record_sent();
        tracing::info!(sent, "total sensor messages sent");
        await_confirmation(delivery, sent, self.counters.clone());

        Ok(Some(sent))
    }

    /// Publish a reading every cycle until `shutdown` resolves or the sensors
    /// fail. In-flight sends are not drained.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        self.start();
        tokio::pin!(shutdown);

        while self.state == RelayState::Running {
            self.tick()?;

            tokio::select! {
                _ = tokio::time::sleep(self.next_sleep()) => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    self.stop();
                }
            }
        }

        Ok(())
    }
}

fn forward_handler<T: Transport>(
    transport: Weak<T>,
    output: String,
    counters: Arc<DeliveryCounters>,
    running: Arc<AtomicBool>,
) -> InputHandler {
    Arc::new(move |message: Message| {
        if !running.load(Ordering::Acquire) {
            tracing::debug!(size = message.payload.len(), "relay stopped; message not forwarded");
            return Disposition::Abandoned;
        }

        tracing::info!(
            data = %String::from_utf8_lossy(&message.payload),
            size = message.payload.len(),
            properties = ?message.properties,
            "message received"
        );
        let received = counters.record_received();
        tracing::info!(received, "total messages received");

        match transport.upgrade() {
            Some(transport) => {
                let delivery = transport.send_event(&output, message);
                await_confirmation(delivery, received, counters.clone());
            }
            None => tracing::warn!("transport is gone; message not forwarded"),
        }

        Disposition::Accepted
    })
}

fn twin_handler(cadence: Arc<Cadence>) -> TwinHandler {
    Arc::new(move |state: TwinUpdateState, desired: &str| {
        tracing::info!(%state, payload = desired, "twin update received");
        apply_twin_update(&cadence, desired);
    })
}

/// Adopt the telemetry cycle of a desired-properties document, if it has one.
fn apply_twin_update(cadence: &Cadence, desired: &str) {
    match codec::decode_cadence(desired) {
        Ok(Some(interval_ms)) => {
            let previous_ms = cadence.set(interval_ms);
            tracing::info!(
                interval_ms = interval_ms.get(),
                previous_ms,
                "telemetry cycle updated"
            );
        }
        Ok(None) => tracing::debug!("twin update leaves the telemetry cycle alone"),
        Err(e) => tracing::warn!(error = %e, "ignoring twin update"),
    }
}

/// Log the outcome of a send once the hub reports it.
fn await_confirmation(delivery: DeliveryFuture, context: u64, counters: Arc<DeliveryCounters>) {
    tokio::spawn(async move {
        let result = delivery.await;
        let confirmed = counters.record_confirmed();
        match result {
            Ok(()) => tracing::info!(context, confirmed, "confirmation received, result = OK"),
            Err(e) => tracing::warn!(context, confirmed, error = %e, "confirmation received, result = ERROR"),
        }
    });
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("read sensors: {0}")]
    Sensor(#[from] sensor::Error),
}
