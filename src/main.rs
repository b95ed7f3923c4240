use anyhow::{Context, Result};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use sensehat_relay::config::Config;
use sensehat_relay::relay::{Cadence, RelayLoop};
use sensehat_relay::sensor::{SenseHat, SensorReader, SimulatedSenseHat};
use sensehat_relay::transport::ModuleClient;
use std::sync::Arc;

fn init_tracing() -> Result<TracerProvider> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    let provider = TracerProvider::builder().build();
    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("sensehat-relay"));

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensehat_relay=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(provider)
}

async fn relay<S: SensorReader>(
    transport: Arc<ModuleClient>,
    sensor: S,
    config: &Config,
) -> Result<()> {
    let cadence = Arc::new(Cadence::new(config.telemetry_cycle_ms));
    let mut relay = RelayLoop::new(transport, sensor, config.routes.clone(), cadence);

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown signal received"),
            Err(err) => {
                tracing::warn!(error = %err, "unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };
    let outcome = relay.run(shutdown).await;

    let totals = relay.counters().snapshot();
    tracing::info!(
        sent = totals.sent,
        received = totals.received,
        confirmed = totals.confirmed,
        "relay stopped"
    );

    outcome.context("relay loop failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let _provider = init_tracing()?;
    let config = Config::from_env()?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting the Sense HAT relay");

    let client = ModuleClient::connect(config.module_settings())
        .await
        .context("connect to the edge hub")?;
    let transport = Arc::new(client);

    if config.simulate_sensors {
        tracing::warn!("using simulated sensor readings");
        relay(transport, SimulatedSenseHat::default(), &config).await
    } else {
        let sensor = SenseHat::with_paths(&config.sysfs_root, &config.dev_root)
            .context("open the Sense HAT")?;
        relay(transport, sensor, &config).await
    }
}
