//! # Sense HAT Relay
//!
//! Sense HAT Relay is an IoT Edge module running on Raspberry Pi that
//! reads the environment from the Sense HAT sensors on a fixed cycle and
//! sends it as JSON to the edge hub, forwards the messages arriving on its
//! input queue to an output queue, and takes its telemetry cycle from the
//! module twin.

pub mod codec;
pub mod config;
pub mod measurement;
pub mod relay;
pub mod sensor;
pub mod transport;
