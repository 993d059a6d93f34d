//! Periodic queue health checks.
//!
//! # Responsibilities
//! - Read job counts of every known queue on a fixed interval
//! - Publish the counts as metrics
//! - Warn when the backlog or the failure rate crosses its threshold
//!
//! Alerts are advisory; the monitor never changes queue state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::config::MonitorConfig;
use crate::observability::metrics;
use crate::queue::job_queue::JobQueue;

/// A threshold breach found by one check.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueAlert {
    Backlog { queue: String, waiting: u64 },
    FailureRate { queue: String, failed: u64, finished: u64, rate: f64 },
}

impl QueueAlert {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueAlert::Backlog { .. } => "backlog",
            QueueAlert::FailureRate { .. } => "failure_rate",
        }
    }
}

pub struct QueueMonitor {
    queue: Arc<JobQueue>,
    config: MonitorConfig,
}

impl QueueMonitor {
    pub fn new(queue: Arc<JobQueue>, config: MonitorConfig) -> Self {
        Self { queue, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Queue monitor disabled");
            return;
        }

        tracing::info!(interval = self.config.interval_secs, "Queue monitor starting");

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Queue monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Inspect every queue once and return the alerts raised.
    pub async fn check_all(&self) -> Vec<QueueAlert> {
        let mut alerts = Vec::new();

        for name in self.queue.queue_names().await {
            let counts = match self.queue.get_job_counts(&name).await {
                Ok(counts) => counts,
                Err(e) => {
                    tracing::error!(queue = %name, error = %e, "Failed to read queue counts");
                    continue;
                }
            };
            metrics::record_queue_counts(&name, &counts);

            if counts.waiting > self.config.backlog_threshold {
                tracing::warn!(
                    queue = %name,
                    waiting = counts.waiting,
                    threshold = self.config.backlog_threshold,
                    "Queue backlog above threshold"
                );
                alerts.push(QueueAlert::Backlog {
                    queue: name.clone(),
                    waiting: counts.waiting,
                });
            }

            let finished = counts.finished();
            if finished >= self.config.min_finished_for_rate.max(1) {
                let rate = counts.failed as f64 / finished as f64;
                if rate > self.config.failure_rate_threshold {
                    tracing::warn!(
                        queue = %name,
                        failed = counts.failed,
                        finished,
                        rate,
                        threshold = self.config.failure_rate_threshold,
                        "Queue failure rate above threshold"
                    );
                    alerts.push(QueueAlert::FailureRate {
                        queue: name.clone(),
                        failed: counts.failed,
                        finished,
                        rate,
                    });
                }
            }
        }

        for alert in &alerts {
            let queue = match alert {
                QueueAlert::Backlog { queue, .. } | QueueAlert::FailureRate { queue, .. } => queue,
            };
            metrics::record_queue_alert(queue, alert.kind());
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::types::{BoxError, JobOptions, JobState};
    use crate::queue::JobHandle;
    use serde_json::{json, Value};

    fn monitor(queue: Arc<JobQueue>, backlog: u64, rate: f64, min_finished: u64) -> QueueMonitor {
        QueueMonitor::new(
            queue,
            MonitorConfig {
                enabled: true,
                interval_secs: 60,
                backlog_threshold: backlog,
                failure_rate_threshold: rate,
                min_finished_for_rate: min_finished,
            },
        )
    }

    #[tokio::test]
    async fn test_backlog_alert() {
        let queue = Arc::new(JobQueue::from_config(&QueueConfig::default()).unwrap());
        for i in 0..3 {
            queue.enqueue_job("research", json!({ "n": i }), JobOptions::default()).await.unwrap();
        }

        let alerts = monitor(queue.clone(), 2, 0.5, 1).check_all().await;
        assert_eq!(
            alerts,
            vec![QueueAlert::Backlog {
                queue: "research".to_string(),
                waiting: 3
            }]
        );

        assert!(monitor(queue, 3, 0.5, 1).check_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_rate_alert() {
        let queue = Arc::new(JobQueue::from_config(&QueueConfig::default()).unwrap());
        let processor = |_job: JobHandle| async move { Err::<Value, BoxError>("upstream down".into()) };
        queue.register_processor("research", processor, Some(1)).await.unwrap();

        let id = queue.enqueue_job("research", json!({}), JobOptions::default()).await.unwrap();
        for _ in 0..200 {
            if queue.get_job_status("research", &id).await.status == JobState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let alerts = monitor(queue.clone(), 100, 0.5, 1).check_all().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind(), "failure_rate");

        // Not enough finished jobs to judge.
        assert!(monitor(queue.clone(), 100, 0.5, 10).check_all().await.is_empty());
        queue.close().await.unwrap();
    }
}
