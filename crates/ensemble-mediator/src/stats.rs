//! Per-agent traffic counters

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub delegations_made: u64,
    pub delegations_received: u64,
    /// Cumulative mean over the received counter.
    pub avg_response_time: f64,
    pub handled_ok: u64,
    pub handled_err: u64,
}

impl AgentStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.handled_ok + self.handled_err;
        if total == 0 {
            1.0
        } else {
            self.handled_ok as f64 / total as f64
        }
    }

    pub(crate) fn observe_response(&mut self, elapsed_secs: f64, ok: bool) {
        if ok {
            self.handled_ok += 1;
        } else {
            self.handled_err += 1;
        }
        let n = self.messages_received.max(1) as f64;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + elapsed_secs) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_defaults_to_one() {
        assert_eq!(AgentStats::default().success_rate(), 1.0);
    }

    #[test]
    fn response_observation_updates_cumulative_mean() {
        let mut stats = AgentStats {
            messages_received: 1,
            ..Default::default()
        };
        stats.observe_response(2.0, true);
        assert!((stats.avg_response_time - 2.0).abs() < 1e-9);

        stats.messages_received = 2;
        stats.observe_response(4.0, false);
        assert!((stats.avg_response_time - 3.0).abs() < 1e-9);
        assert!((stats.success_rate() - 0.5).abs() < 1e-9);
    }
}
