//! Background liveness and anomaly telemetry

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ensemble_mediator::Mediator;

use crate::config::MonitoringSection;

const HISTORY_LIMIT: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f32,
    pub memory_usage_percent: f32,
    pub messages_sent_total: u64,
    pub delegations_total: u64,
    pub pending_messages: usize,
    pub anomalies: Vec<String>,
}

pub struct HealthMonitor {
    section: MonitoringSection,
    system: Mutex<System>,
    history: Mutex<VecDeque<HealthSnapshot>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(section: MonitoringSection) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            section,
            system: Mutex::new(System::new()),
            history: Mutex::new(VecDeque::new()),
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Start the periodic sampling task. Each tick samples, flags
    /// anomalies, and persists a snapshot file.
    pub fn start(self: &Arc<Self>, mediator: Arc<Mediator>) {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.section.interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = monitor.sample(&mediator);
                        monitor.persist(&snapshot).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("health monitor stopping");
                            break;
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
        info!(interval_secs = self.section.interval_secs, "health monitor started");
    }

    pub fn sample(&self, mediator: &Mediator) -> HealthSnapshot {
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            let cpu = system.global_cpu_info().cpu_usage();
            let memory = if system.total_memory() > 0 {
                system.used_memory() as f32 / system.total_memory() as f32 * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        let stats = mediator.get_stats(None);
        let messages_sent_total = stats.values().map(|s| s.messages_sent).sum();
        let delegations_total = stats.values().map(|s| s.delegations_made).sum();

        let mut anomalies = Vec::new();
        if cpu > self.section.cpu_threshold_percent {
            anomalies.push(format!("cpu usage {:.1}% over threshold", cpu));
        }
        if memory > self.section.memory_threshold_percent {
            anomalies.push(format!("memory usage {:.1}% over threshold", memory));
        }
        for (agent, agent_stats) in &stats {
            if agent_stats.success_rate() < 0.5 && agent_stats.handled_err >= 3 {
                anomalies.push(format!(
                    "agent {} success rate {:.0}%",
                    agent,
                    agent_stats.success_rate() * 100.0
                ));
            }
        }
        if !anomalies.is_empty() {
            warn!(?anomalies, "health anomalies detected");
        }

        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            cpu_usage_percent: cpu,
            memory_usage_percent: memory,
            messages_sent_total,
            delegations_total,
            pending_messages: mediator.pending_count(),
            anomalies,
        };

        let mut history = self.history.lock();
        history.push_back(snapshot.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        snapshot
    }

    async fn persist(&self, snapshot: &HealthSnapshot) {
        let path = &self.section.state_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        match serde_json::to_string_pretty(snapshot) {
            Ok(raw) => {
                if let Err(err) = tokio::fs::write(path, raw).await {
                    debug!(error = %err, "could not persist health snapshot");
                }
            }
            Err(err) => debug!(error = %err, "could not serialize health snapshot"),
        }
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.history.lock().back().cloned()
    }

    pub fn history(&self) -> Vec<HealthSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Stop the periodic task; in-flight work observes the signal and
    /// exits cleanly.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.lock().take() {
            let _ = handle.await;
        }
        info!("health monitor stopped");
    }
}
