//! sluiced — supervised change-data-streaming agent
//!
//! Wires the tracker, schema registry, validator, driver, and consumer
//! together, exposes the loopback control surface, and translates the
//! supervisor's outcome into an exit code the outer wrapper understands:
//! 0 normal, 1 fatal error, 3 incorrect usage, 4 intentional restart,
//! 5 upstream disconnected.

mod cli;
mod control;
mod logfile;
mod server;

use clap::Parser;
use cli::{Cli, Config};
use control::{ControlState, ControlSignal};
use logfile::{RotatingLogSink, SinkWriter};
use metrics_exporter_prometheus::PrometheusBuilder;
use server::{EXIT_ERROR, EXIT_INCORRECT_USAGE};
use sluice::consumer::SharedDriver;
use sluice::upstream::nats::{NatsConfig, NatsUpstream};
use sluice::upstream::UpstreamClient;
use sluice::{
    ApiRegistry, Consumer, ConsumerConfig, Driver, DriverConfig, FileDriver, SchemaRegistry,
    SchemaValidator, Tracker,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.validate() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("error: {msg}");
            std::process::exit(EXIT_INCORRECT_USAGE);
        }
    };
    std::process::exit(run(config).await);
}

fn init_tracing(config: &Config, sink: Arc<RotatingLogSink>) {
    let level = if config.silent {
        "error"
    } else if config.verbose {
        "trace"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(SinkWriter(sink)),
        )
        .init();
}

/// Build the sink driver named by the connection string's scheme.
fn create_driver(url: &str) -> Result<Box<dyn Driver>, String> {
    match url.split("://").next() {
        Some("file") => Ok(Box::new(FileDriver::new())),
        Some(scheme) => Err(format!("no driver registered for scheme {scheme:?}")),
        None => Err("driver url is required".to_string()),
    }
}

async fn run(config: Config) -> i32 {
    let started = Instant::now();

    let log_sink = match RotatingLogSink::new(&config.logs_dir) {
        Ok(sink) => sink,
        Err(err) => {
            eprintln!("error creating log file sink: {err}");
            return EXIT_INCORRECT_USAGE;
        }
    };
    init_tracing(&config, log_sink.clone());
    debug!(dir = %config.logs_dir.display(), "using log file sink");

    let tracker = match Tracker::open(&config.data_dir) {
        Ok(tracker) => Arc::new(tracker),
        Err(err) => {
            error!(error = %err, "error creating tracker db");
            return EXIT_INCORRECT_USAGE;
        }
    };

    let registry: Arc<dyn SchemaRegistry> = match ApiRegistry::new(
        &config.api_url,
        config.api_key.clone(),
        tracker.clone(),
        &config.data_dir,
    ) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!(error = %err, "error creating registry");
            return EXIT_INCORRECT_USAGE;
        }
    };

    let validator = match &config.schema_validator {
        Some(dir) => match SchemaValidator::load(dir) {
            Ok(validator) => Some(validator),
            Err(err) => {
                error!(error = %err, "error loading validator");
                return EXIT_INCORRECT_USAGE;
            }
        },
        None => None,
    };

    let watermarks = match tracker.export_watermarks() {
        Ok(watermarks) => watermarks,
        Err(err) => {
            error!(error = %err, "error loading table export data");
            return EXIT_INCORRECT_USAGE;
        }
    };

    let mut driver = match create_driver(&config.url) {
        Ok(driver) => driver,
        Err(msg) => {
            error!("error creating driver: {msg}");
            return EXIT_INCORRECT_USAGE;
        }
    };
    let driver_config = DriverConfig {
        url: config.url.clone(),
        data_dir: config.data_dir.clone(),
        registry: Some(registry.clone()),
        tracker: Some(tracker.clone()),
    };
    if let Err(err) = driver.start(driver_config).await {
        error!(error = %err, "error starting driver");
        return EXIT_INCORRECT_USAGE;
    }
    let driver: SharedDriver = Arc::new(tokio::sync::Mutex::new(driver));

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "error installing metrics recorder");
            return EXIT_INCORRECT_USAGE;
        }
    };

    let (control_tx, control_rx) = mpsc::channel::<ControlSignal>(8);
    let control_state = ControlState {
        control_tx,
        log_sink: log_sink.clone(),
        metrics: prometheus,
    };
    let control_port = config.port;
    tokio::spawn(async move {
        if let Err(err) = control::serve(control_port, control_state).await {
            error!(error = %err, "control surface failed");
        }
    });

    let client: Arc<dyn UpstreamClient> = match NatsUpstream::connect(NatsConfig {
        url: config.server.clone(),
        credentials: config.creds.clone(),
        name: format!("sluice-{}", config.company_id),
    })
    .await
    {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "error connecting upstream");
            return EXIT_ERROR;
        }
    };

    let consumer_config = ConsumerConfig {
        company_id: config.company_id.clone(),
        company_ids: config.company_ids.clone(),
        suffix: config.consumer_suffix.clone(),
        max_ack_pending: config.max_ack_pending,
        max_pending_buffer: config.max_pending_buffer,
        min_pending_latency: config.min_pending_latency,
        max_pending_latency: config.max_pending_latency,
        deliver_all: config.deliver_all,
        export_table_timestamps: watermarks,
        validator,
        registry: Some(registry),
    };
    let mut consumer = match Consumer::create(consumer_config, client, driver.clone()).await {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(error = %err, "error creating consumer");
            return EXIT_ERROR;
        }
    };
    if let Err(err) = consumer.start().await {
        error!(error = %err, "error starting consumer");
        return EXIT_ERROR;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        durable = consumer.name(),
        "server is running"
    );

    let code = server::supervise(consumer, control_rx).await;

    // the driver outlives the consumer so the final flush above could
    // still commit; stop it only now
    if let Err(err) = driver.lock().await.stop().await {
        error!(error = %err, "error stopping driver");
    }
    drop(driver);
    drop(tracker);

    debug!(uptime = ?started.elapsed(), "server was up");
    info!("bye");
    code
}
