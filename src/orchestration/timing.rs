//! Adaptive timing model.
//!
//! Learns how long each agent kind takes and turns that into two control
//! signals: a per-kind timeout that tracks observed runtimes, and a
//! concurrency suggestion that widens the pool when kinds run at very
//! different speeds. It also keeps a cache of resumable agent sessions and
//! decides when those sessions have gone stale.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::AgentDescriptor;
use crate::{clog_debug, clog_trace};

/// Runtime samples kept per agent kind.
pub const RUNTIME_HISTORY_CAP: usize = 5;

/// Lower bound on any adaptive timeout (2 minutes).
pub const MIN_ADAPTIVE_TIMEOUT_MS: u64 = 120_000;

/// Adaptive timeouts never drop below this share of the configured timeout.
pub const TIMEOUT_FLOOR_FRACTION: f64 = 0.25;

/// Ratio between slowest and fastest kinds that triggers an extra slot.
pub const SPEED_SPREAD_THRESHOLD: f64 = 3.0;

/// Consecutive empty rounds after which a session is dropped.
pub const MAX_EMPTY_ROUNDS: u32 = 5;

/// Rounds a session may live before it is dropped.
pub const MAX_SESSION_AGE_ROUNDS: u32 = 10;

/// One effectiveness observation after an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EffectivenessSample {
    pub items_produced: u64,
    pub cost: f64,
    pub elapsed_seconds: f64,
    pub is_empty_work: bool,
}

/// Accumulated effectiveness counters for one agent kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEffectiveness {
    pub runs: u64,
    /// Runs that did real work and produced at least one item.
    pub completed_tasks: u64,
    pub empty_runs: u64,
    pub items_produced: u64,
    pub total_cost: f64,
    pub total_elapsed_seconds: f64,
}

/// A cached continuation token for an agent kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub session_id: String,
    /// Round in which the session was created.
    pub started_round: u32,
}

/// Everything the model knows, in a form the checkpoint store can persist.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSnapshot {
    #[serde(default)]
    pub runtime_history: HashMap<String, Vec<f64>>,
    #[serde(default)]
    pub effectiveness: HashMap<String, AgentEffectiveness>,
    #[serde(default)]
    pub sessions: HashMap<String, AgentSession>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveTiming {
    default_timeout: Duration,
    runtime_history: HashMap<String, VecDeque<f64>>,
    effectiveness: HashMap<String, AgentEffectiveness>,
    sessions: HashMap<String, AgentSession>,
}

impl AdaptiveTiming {
    /// `default_timeout` applies to agents without their own override.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            runtime_history: HashMap::new(),
            effectiveness: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // ========== Runtime history ==========

    /// Append a runtime sample, dropping the oldest beyond the cap.
    pub fn record_agent_runtime(&mut self, agent_kind: &str, seconds: f64) {
        let history = self.runtime_history.entry(agent_kind.to_string()).or_default();
        history.push_back(seconds);
        while history.len() > RUNTIME_HISTORY_CAP {
            history.pop_front();
        }
        clog_trace!("Runtime sample kind={} seconds={:.1}", agent_kind, seconds);
    }

    pub fn runtime_history(&self, agent_kind: &str) -> Vec<f64> {
        self.runtime_history
            .get(agent_kind)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    fn average_runtime(&self, agent_kind: &str) -> Option<f64> {
        let history = self.runtime_history.get(agent_kind)?;
        if history.is_empty() {
            return None;
        }
        Some(history.iter().sum::<f64>() / history.len() as f64)
    }

    /// Timeout for the next run of `agent`.
    ///
    /// Without history this is the configured timeout (agent override, else
    /// global). With history it is twice the average runtime, raised to at
    /// least `max(25% of configured, 2 minutes)` and capped at the configured
    /// timeout. The cap wins when the two bounds cross.
    pub fn adaptive_timeout(&self, agent: &AgentDescriptor) -> Duration {
        let configured = agent.effective_timeout(self.default_timeout);
        let Some(average) = self.average_runtime(&agent.kind) else {
            return configured;
        };

        let configured_ms = configured.as_millis() as f64;
        let raw_ms = 2.0 * average * 1000.0;
        let floor_ms = (configured_ms * TIMEOUT_FLOOR_FRACTION).max(MIN_ADAPTIVE_TIMEOUT_MS as f64);
        let timeout_ms = raw_ms.max(floor_ms).min(configured_ms);

        clog_debug!(
            "Adaptive timeout kind={} avg={:.1}s raw={:.0}ms floor={:.0}ms timeout={:.0}ms",
            agent.kind,
            average,
            raw_ms,
            floor_ms,
            timeout_ms
        );
        Duration::from_millis(timeout_ms.round() as u64)
    }

    /// Suggest a concurrency level from how unevenly agent kinds perform.
    ///
    /// Returns `configured` unless at least two kinds have history and the
    /// slowest average is 3x the fastest or more. In that case one more slot
    /// is granted, as long as that does not exceed the number of kinds seen.
    /// An unlimited pool (`configured == 0`) stays unlimited.
    pub fn dynamic_concurrency(&self, configured: usize) -> usize {
        if configured == 0 {
            return 0;
        }
        let averages: Vec<f64> = self
            .runtime_history
            .keys()
            .filter_map(|kind| self.average_runtime(kind))
            .collect();
        if averages.len() < 2 {
            return configured;
        }

        let fastest = averages.iter().copied().fold(f64::INFINITY, f64::min);
        let slowest = averages.iter().copied().fold(0.0, f64::max);
        let ratio = if fastest > 0.0 {
            slowest / fastest
        } else {
            f64::INFINITY
        };
        if ratio < SPEED_SPREAD_THRESHOLD {
            return configured;
        }

        let suggested = (configured + 1).min(averages.len()).max(configured);
        if suggested != configured {
            clog_debug!(
                "Dynamic concurrency {} -> {} (speed ratio {:.1})",
                configured,
                suggested,
                ratio
            );
        }
        suggested
    }

    // ========== Effectiveness ==========

    pub fn record_agent_effectiveness(&mut self, agent_kind: &str, sample: EffectivenessSample) {
        let stats = self.effectiveness.entry(agent_kind.to_string()).or_default();
        stats.runs += 1;
        stats.items_produced += sample.items_produced;
        stats.total_cost += sample.cost;
        stats.total_elapsed_seconds += sample.elapsed_seconds;
        if sample.is_empty_work {
            stats.empty_runs += 1;
        } else if sample.items_produced >= 1 {
            stats.completed_tasks += 1;
        }
    }

    pub fn effectiveness(&self, agent_kind: &str) -> Option<&AgentEffectiveness> {
        self.effectiveness.get(agent_kind)
    }

    // ========== Sessions ==========

    pub fn record_agent_session(&mut self, agent_kind: &str, session_id: &str, round: u32) {
        self.sessions.insert(
            agent_kind.to_string(),
            AgentSession {
                session_id: session_id.to_string(),
                started_round: round,
            },
        );
    }

    pub fn agent_session(&self, agent_kind: &str) -> Option<&str> {
        self.sessions
            .get(agent_kind)
            .map(|s| s.session_id.as_str())
    }

    /// Drop the cached session for a kind. Returns whether one existed.
    pub fn invalidate_agent_session(&mut self, agent_kind: &str) -> bool {
        let removed = self.sessions.remove(agent_kind).is_some();
        if removed {
            clog_debug!("Session invalidated kind={}", agent_kind);
        }
        removed
    }

    /// Drop sessions that went 5+ rounds without output or are over 10 rounds old.
    ///
    /// Returns the invalidated kinds, sorted.
    pub fn invalidate_stale_sessions(
        &mut self,
        current_round: u32,
        consecutive_empty_rounds: &HashMap<String, u32>,
    ) -> Vec<String> {
        let mut stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(kind, session)| {
                let empty = consecutive_empty_rounds.get(*kind).copied().unwrap_or(0);
                let age = current_round.saturating_sub(session.started_round);
                empty >= MAX_EMPTY_ROUNDS || age > MAX_SESSION_AGE_ROUNDS
            })
            .map(|(kind, _)| kind.clone())
            .collect();
        stale.sort();

        for kind in &stale {
            self.invalidate_agent_session(kind);
        }
        stale
    }

    // ========== Persistence ==========

    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            runtime_history: self
                .runtime_history
                .iter()
                .map(|(kind, h)| (kind.clone(), h.iter().copied().collect()))
                .collect(),
            effectiveness: self.effectiveness.clone(),
            sessions: self.sessions.clone(),
        }
    }

    /// Replace all learned state with `snapshot`, keeping the containers.
    pub fn restore(&mut self, snapshot: &TimingSnapshot) {
        self.runtime_history.clear();
        for (kind, samples) in &snapshot.runtime_history {
            let start = samples.len().saturating_sub(RUNTIME_HISTORY_CAP);
            self.runtime_history
                .insert(kind.clone(), samples[start..].iter().copied().collect());
        }
        self.effectiveness.clear();
        self.effectiveness.extend(
            snapshot
                .effectiveness
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.sessions.clear();
        self.sessions.extend(
            snapshot
                .sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}

impl Default for AdaptiveTiming {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS))
    }
}
