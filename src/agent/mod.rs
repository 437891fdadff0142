use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::classify::Classifier;
use crate::bridge::field::FieldSpec;
use crate::bridge::registry::KeyRegistry;
use crate::bridge::table::AggregationTable;
use crate::bridge::{Bridge, Pipeline};
use crate::catalog::{self, ServiceRegistration};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::thingspeak::ThingSpeakSink;
use crate::source::MqttSource;

/// Agent wires the MQTT source, the aggregation bridge, the catalog and the
/// sink together, and owns their lifecycle.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    bridge: Option<Bridge<catalog::Client, ThingSpeakSink>>,
    source: Option<MqttSource>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            bridge: None,
            source: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin bridging.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Aggregation state, so /state has something to serve.
        let spec = Arc::new(FieldSpec::new(&self.cfg.fields).context("building field spec")?);
        let policy = self.cfg.schedule.policy();
        let table = Arc::new(AggregationTable::new(Arc::clone(&spec), policy));

        self.health
            .start(Some(Arc::clone(&table)))
            .await
            .context("starting health metrics server")?;

        let classifier =
            Arc::new(Classifier::new(&self.cfg.channels).context("building topic classifier")?);
        let subscriptions = classifier.subscriptions();

        // 1. Catalog: optional self-registration and credential warm-up.
        let phase = Instant::now();
        let catalog = self.create_catalog_client()?;

        if self.cfg.catalog.register_service {
            let registration = ServiceRegistration {
                service_id: self.cfg.catalog.service_id.clone(),
                subscriptions: subscriptions.clone(),
                publications: Vec::new(),
            };
            if let Err(e) = catalog.register_service(&registration).await {
                warn!(error = %format!("{e:#}"), "service registration failed, continuing");
            }
        }

        let registry = Arc::new(KeyRegistry::new(
            catalog,
            self.cfg.catalog.credentials_ttl,
            Some(Arc::clone(&self.health)),
        ));

        if self.cfg.catalog.preload {
            match registry.preload().await {
                Ok(loaded) => info!(keys = loaded, "preloaded credentials from catalog"),
                Err(e) => warn!(
                    error = %format!("{e:#}"),
                    "credential preload failed, resolving lazily",
                ),
            }
        }
        self.record_phase("catalog", phase);

        // 2. Bridge.
        let phase = Instant::now();
        let sink = Arc::new(ThingSpeakSink::new(&self.cfg.sink).context("creating sink")?);
        let pipeline = Pipeline::new(
            classifier,
            registry,
            table,
            sink,
            self.cfg.sink.timeout,
            Some(Arc::clone(&self.health)),
        );

        let mut bridge = Bridge::new(
            pipeline,
            self.cfg.schedule.tick_interval,
            self.cfg.schedule.max_concurrent_flushes,
            self.cfg.mqtt.channel_capacity,
        );
        bridge.start(self.cancel.clone()).context("starting bridge")?;
        let tx = bridge.sender();
        self.bridge = Some(bridge);
        self.record_phase("bridge", phase);

        // 3. MQTT source, last so nothing is received before the bridge runs.
        let phase = Instant::now();
        let mut source = MqttSource::new(
            &self.cfg.mqtt,
            subscriptions,
            Some(Arc::clone(&self.health)),
        );
        source
            .start(self.cancel.clone(), tx)
            .context("starting MQTT source")?;
        self.source = Some(source);
        self.record_phase("source", phase);

        info!(
            fields = spec.len(),
            min_period = ?policy.min_period,
            flush_interval = ?policy.flush_interval,
            "agent started"
        );

        Ok(())
    }

    /// Stop all components. In-flight flushes are awaited.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(source) = &mut self.source {
            source.wait_for_shutdown().await;
        }

        if let Some(bridge) = &mut self.bridge {
            bridge.wait_for_shutdown().await;
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Create a catalog client with metrics callback.
    fn create_catalog_client(&self) -> Result<catalog::Client> {
        let client = catalog::Client::new(&self.cfg.catalog).context("creating catalog client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health
                .catalog_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .catalog_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }

    fn record_phase(&self, phase: &str, started: Instant) {
        self.health
            .agent_start_duration
            .with_label_values(&[phase])
            .set(started.elapsed().as_secs_f64());
    }
}
