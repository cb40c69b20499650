//! Pipeline orchestration -- assembly, hook wiring, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `reqshield-daemon`.
//! It loads configuration, compiles the detection ruleset, builds the
//! security pipeline, subscribes it to the server hooks and runs the
//! main loop until a shutdown signal arrives.
//!
//! # Startup Order
//!
//! 1. Metrics recorder (so pipeline counters are captured from the start)
//! 2. Detection ruleset
//! 3. Security pipeline, enabled on the server hooks
//! 4. Security event logger
//!
//! # Shutdown Order
//!
//! 1. Security pipeline (unsubscribe, drain in-flight requests)
//! 2. Background tasks (event logger, uptime updater)

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use reqshield_appsec::{
    AppsecConfig, DetectionEngine, RulesetEngine, SecurityPipeline, SecurityPipelineBuilder,
    ServerHooks,
};
use reqshield_core::config::ReqshieldConfig;
use reqshield_core::event::{Event, SecurityEvent};
use reqshield_core::health::HealthStatus;

use crate::health::{ComponentHealth, DaemonHealth, aggregate_status};
use crate::metrics_server;
use crate::replay::{self, ReplayOutcome};

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: ReqshieldConfig,
    /// Security pipeline over the compiled ruleset.
    pipeline: SecurityPipeline<RulesetEngine>,
    /// Server hooks the pipeline subscribes to.
    hooks: Arc<ServerHooks>,
    /// Shutdown broadcast sender (signals all background tasks).
    shutdown_tx: broadcast::Sender<()>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
    /// Security event receiver, consumed by the event logger on start.
    event_rx: Option<mpsc::Receiver<SecurityEvent>>,
    /// Running background tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Load configuration and build the orchestrator.
    ///
    /// This performs the following steps:
    /// 1. Load `reqshield.toml` and apply environment variable overrides
    /// 2. Validate the configuration
    /// 3. Compile the detection ruleset
    /// 4. Build the security pipeline
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or parsed
    /// - Configuration validation fails
    /// - The ruleset cannot be loaded or compiled
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = ReqshieldConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    pub async fn build_from_config(config: ReqshieldConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let appsec_config = AppsecConfig::from_core(&config);
        let engine = load_engine(&appsec_config).await?;
        tracing::info!(
            rules = engine.rule_count(),
            rules_version = engine.rules_version(),
            "detection ruleset loaded"
        );

        let (pipeline, event_rx) = SecurityPipelineBuilder::new()
            .config(appsec_config)
            .engine(engine)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build security pipeline: {}", e))?;

        let (shutdown_tx, _) = broadcast::channel(16);

        if config.metrics.enabled {
            record_daemon_metrics();
        }

        tracing::info!("orchestrator initialized");

        Ok(Self {
            config,
            pipeline,
            hooks: Arc::new(ServerHooks::new()),
            shutdown_tx,
            start_time: Instant::now(),
            event_rx,
            tasks: Vec::new(),
        })
    }

    /// Enable the pipeline on the server hooks and start background tasks.
    ///
    /// Calling `start` again while running is a no-op for the pipeline.
    pub fn start(&mut self) -> Result<()> {
        self.pipeline
            .enable(Arc::clone(&self.hooks))
            .map_err(|e| anyhow::anyhow!("failed to enable security pipeline: {}", e))?;

        if let Some(event_rx) = self.event_rx.take() {
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tasks.push(spawn_event_logger(event_rx, shutdown_rx));
        }

        if self.config.metrics.enabled {
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tasks.push(spawn_uptime_updater(self.start_time, shutdown_rx));
        }

        tracing::info!("security pipeline enabled");
        Ok(())
    }

    /// Replay a request transcript through the running pipeline.
    pub async fn replay(&self, path: &Path) -> Result<Vec<ReplayOutcome>> {
        replay::replay_file(&self.pipeline, &self.hooks, path).await
    }

    /// Start, then block until a shutdown signal is received.
    ///
    /// # Shutdown Triggers
    ///
    /// - `SIGTERM` (from systemd, Docker, or `kill`)
    /// - `SIGINT` (Ctrl+C)
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;

        tracing::info!("entering main loop");
        let signal = wait_for_shutdown_signal().await?;
        tracing::info!(signal = signal, "shutdown signal received");

        self.shutdown().await;
        Ok(())
    }

    /// Disable the pipeline and stop background tasks.
    ///
    /// In-flight requests are drained before the event logger stops, so
    /// their final security events are still logged.
    pub async fn shutdown(&mut self) {
        tracing::info!("disabling security pipeline");
        self.pipeline.disable().await;

        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("reqshield-daemon shut down");
    }

    /// Get the current aggregated health status.
    pub fn health(&self) -> DaemonHealth {
        let waf_enabled = self.pipeline.config().waf_enabled;
        let ruleset_status = if self.pipeline.engine().rule_count() == 0 {
            HealthStatus::Degraded("ruleset has no rules".to_owned())
        } else {
            HealthStatus::Healthy
        };

        let components = vec![
            ComponentHealth {
                name: "security-pipeline".to_owned(),
                enabled: true,
                status: self.pipeline.health_check(),
            },
            ComponentHealth {
                name: "waf-ruleset".to_owned(),
                enabled: waf_enabled,
                status: ruleset_status,
            },
        ];

        let uptime_secs = self.start_time.elapsed().as_secs();
        if self.config.metrics.enabled {
            use reqshield_core::metrics as m;
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status: aggregate_status(&components),
            uptime_secs,
            components,
        }
    }

    /// Server hooks a request integration publishes to.
    pub fn hooks(&self) -> &Arc<ServerHooks> {
        &self.hooks
    }

    /// The security pipeline.
    pub fn pipeline(&self) -> &SecurityPipeline<RulesetEngine> {
        &self.pipeline
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &ReqshieldConfig {
        &self.config
    }
}

/// Load and compile the ruleset named by the configuration.
pub async fn load_engine(config: &AppsecConfig) -> Result<RulesetEngine> {
    RulesetEngine::from_source(&config.rules)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load ruleset: {}", e))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Spawn a background task that logs security events for audit.
fn spawn_event_logger(
    mut event_rx: mpsc::Receiver<SecurityEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => log_security_event(&event),
                        None => {
                            tracing::debug!("security event channel closed, exiting logger");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Drain what the pipeline emitted before shutdown.
                    while let Ok(event) = event_rx.try_recv() {
                        log_security_event(&event);
                    }
                    tracing::debug!("security event logger shutting down");
                    break;
                }
            }
        }
    })
}

fn log_security_event(event: &SecurityEvent) {
    match event {
        SecurityEvent::Attack(attack) => {
            tracing::warn!(
                event_id = %attack.id,
                request_id = %attack.request_id,
                trace_id = %attack.metadata.trace_id,
                rules_version = %attack.rules_version,
                blocking = attack.is_blocking(),
                matches = %attack.matches,
                "attack observed"
            );
        }
        SecurityEvent::Vulnerability(vuln) => {
            tracing::warn!(
                event_id = %vuln.id,
                request_id = %vuln.request_id,
                trace_id = %vuln.metadata.trace_id,
                count = vuln.count,
                event_type = vuln.event_type(),
                "vulnerabilities reported"
            );
        }
    }
}

/// Record daemon-level metrics once during initialization.
fn record_daemon_metrics() {
    use reqshield_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

/// Spawn a background task that periodically updates the uptime metric.
///
/// Updates every 10 seconds to keep the metric fresh for Prometheus scrapes.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    use reqshield_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
