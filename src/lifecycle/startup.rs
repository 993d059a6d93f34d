//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the shared registries from validated configuration
//! - Register the built-in processors
//! - Start background tasks (queue monitor, config watcher, admin API)
//! - Wait for a shutdown signal and stop everything in order
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Shutdown order: stop listeners and monitor, drain the queue, flush storage

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::admin::{self, AdminState};
use crate::config::loader::ConfigError;
use crate::config::watcher::ConfigWatcher;
use crate::config::AppConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::shutdown_signal;
use crate::processors::{OutboundCallProcessor, OUTBOUND_QUEUE};
use crate::queue::{JobQueue, QueueError, QueueMonitor};
use crate::resilience::ResilienceRegistry;

/// Longest the queue may take to drain in-flight jobs on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("job queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid address '{address}': {message}")]
    Address { address: String, message: String },

    #[error("config watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Everything the composition root owns.
pub struct Services {
    pub config: AppConfig,
    pub registry: Arc<ResilienceRegistry>,
    pub queue: Arc<JobQueue>,
    pub shutdown: Arc<Shutdown>,
}

impl Services {
    /// Build registries and the queue, and register built-in processors.
    pub async fn build(config: AppConfig) -> Result<Self, StartupError> {
        let registry = Arc::new(ResilienceRegistry::from_config(&config));
        let queue = Arc::new(JobQueue::from_config(&config.queue)?);

        queue
            .register_processor(OUTBOUND_QUEUE, OutboundCallProcessor::new(registry.clone()), None)
            .await?;

        Ok(Self {
            config,
            registry,
            queue,
            shutdown: Arc::new(Shutdown::new()),
        })
    }
}

/// Run until SIGINT/SIGTERM, then shut down gracefully.
pub async fn run(services: Services, config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let Services {
        config,
        registry,
        queue,
        shutdown,
    } = services;

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let monitor = QueueMonitor::new(queue.clone(), config.queue.monitor.clone());
    tasks.push(tokio::spawn(monitor.run(shutdown.subscribe())));

    // Keep the watcher alive until shutdown.
    let _watcher = match &config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let registry = registry.clone();
            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = updates.recv() => match update {
                            Some(new_config) => {
                                registry.apply_config(&new_config);
                                tracing::info!("Configuration reloaded");
                            }
                            None => break,
                        },
                        _ = stop.recv() => break,
                    }
                }
            }));
            Some(watcher)
        }
        None => None,
    };

    if config.admin.enabled {
        let addr = parse_addr(&config.admin.bind_address)?;
        let state = AdminState::new(queue.clone(), registry.clone(), config.admin.api_key.clone());
        let stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, state, stop).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    tracing::info!(backend = queue.backend_kind().as_str(), "Service ready");

    let signal = shutdown_signal().await;
    tracing::info!(signal, "Shutdown signal received");
    shutdown.trigger();

    match tokio::time::timeout(DRAIN_TIMEOUT, queue.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Job queue did not close cleanly"),
        Err(_) => tracing::warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Timed out draining job queue"),
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task failed");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

pub fn parse_addr(address: &str) -> Result<SocketAddr, StartupError> {
    address.parse().map_err(|e: std::net::AddrParseError| StartupError::Address {
        address: address.to_string(),
        message: e.to_string(),
    })
}
