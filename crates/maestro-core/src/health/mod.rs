//! Worker health monitoring and stuck-agent recovery.
//!
//! Workers emit heartbeats; a poll loop flags any worker that reports
//! "working" but has gone silent past the stuck threshold. Registered
//! recovery callbacks fire per detection until the restart limit, after
//! which the worker is marked dead and left alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Callback invoked with `(agent_id, task_id)` when a worker is stuck.
pub type RecoveryCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Heartbeat record for one worker.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub agent_id: String,
    pub last_beat: Instant,
    pub last_task_id: Option<String>,
    pub status: String,
    pub consecutive_stuck: u32,
}

impl Heartbeat {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            last_beat: Instant::now(),
            last_task_id: None,
            status: "idle".to_string(),
            consecutive_stuck: 0,
        }
    }

    pub fn since_last_beat(&self) -> Duration {
        self.last_beat.elapsed()
    }
}

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between health sweeps.
    pub poll_interval: Duration,
    /// Silence beyond this while "working" marks a worker stuck.
    pub stuck_threshold: Duration,
    /// Consecutive stuck detections before a worker is declared dead.
    pub max_restarts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(900),
            max_restarts: 3,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    heartbeats: HashMap<String, Heartbeat>,
    callbacks: Vec<RecoveryCallback>,
}

/// Monitors worker heartbeats and triggers recovery for stuck workers.
pub struct HealthMonitor {
    config: HealthConfig,
    state: Arc<Mutex<MonitorState>>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MonitorState::default())),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a worker for monitoring, starting from a fresh beat.
    pub fn register_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .heartbeats
            .insert(agent_id.to_string(), Heartbeat::new(agent_id));
    }

    /// Remove a worker from monitoring.
    pub fn unregister_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats.remove(agent_id);
    }

    /// Record a heartbeat. Unknown workers are registered on the fly; a
    /// beat resets the consecutive-stuck counter.
    pub fn record_heartbeat(&self, agent_id: &str, task_id: Option<&str>, status: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let beat = state
            .heartbeats
            .entry(agent_id.to_string())
            .or_insert_with(|| Heartbeat::new(agent_id));
        beat.last_beat = Instant::now();
        beat.last_task_id = task_id.map(str::to_string);
        beat.status = status.to_string();
        beat.consecutive_stuck = 0;
    }

    /// Register a recovery callback for stuck workers.
    pub fn on_stuck(&self, callback: RecoveryCallback) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.callbacks.push(callback);
    }

    /// Run one health sweep, returning the agents flagged stuck this pass.
    pub fn check_agents(&self) -> Vec<String> {
        let mut flagged = Vec::new();
        let mut fire: Vec<(RecoveryCallback, String, Option<String>)> = Vec::new();

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let callbacks = state.callbacks.clone();
            for beat in state.heartbeats.values_mut() {
                if beat.status != "working" {
                    continue;
                }
                if beat.since_last_beat() <= self.config.stuck_threshold {
                    continue;
                }

                beat.consecutive_stuck += 1;
                tracing::warn!(
                    agent_id = %beat.agent_id,
                    silent_for = ?beat.since_last_beat(),
                    consecutive = beat.consecutive_stuck,
                    "worker appears stuck"
                );

                if beat.consecutive_stuck <= self.config.max_restarts {
                    flagged.push(beat.agent_id.clone());
                    for cb in &callbacks {
                        fire.push((
                            Arc::clone(cb),
                            beat.agent_id.clone(),
                            beat.last_task_id.clone(),
                        ));
                    }
                } else {
                    tracing::error!(
                        agent_id = %beat.agent_id,
                        max_restarts = self.config.max_restarts,
                        "worker exceeded restart limit, marking dead"
                    );
                    beat.status = "dead".to_string();
                }
            }
        }

        // Callbacks run outside the lock so they may call back in.
        for (cb, agent_id, task_id) in fire {
            cb(&agent_id, task_id.as_deref());
        }

        flagged
    }

    /// Start the poll loop. Returns a handle that stops with `stop()`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        tracing::info!(
            poll_interval = ?monitor.config.poll_interval,
            stuck_threshold = ?monitor.config.stuck_threshold,
            "health monitor started"
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(monitor.config.poll_interval) => {
                        monitor.check_agents();
                    }
                }
            }
            tracing::info!("health monitor stopped");
        })
    }

    /// Stop the poll loop cooperatively.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of one worker's heartbeat.
    pub fn heartbeat(&self, agent_id: &str) -> Option<Heartbeat> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats.get(agent_id).cloned()
    }

    /// Whether a worker is currently past the stuck threshold.
    pub fn is_stuck(&self, agent_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats.get(agent_id).is_some_and(|b| {
            b.status == "working" && b.since_last_beat() > self.config.stuck_threshold
        })
    }

    pub fn agent_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(stuck_ms: u64) -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            poll_interval: Duration::from_millis(10),
            stuck_threshold: Duration::from_millis(stuck_ms),
            max_restarts: 3,
        })
    }

    #[tokio::test]
    async fn idle_workers_are_never_stuck() {
        let monitor = monitor(10);
        monitor.register_agent("a");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(monitor.check_agents().is_empty());
        assert!(!monitor.is_stuck("a"));
    }

    #[tokio::test]
    async fn silent_working_agent_triggers_recovery() {
        let monitor = monitor(10);
        monitor.record_heartbeat("a", Some("t1"), "working");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        monitor.on_stuck(Arc::new(move |agent_id, task_id| {
            assert_eq!(agent_id, "a");
            assert_eq!(task_id, Some("t1"));
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let flagged = monitor.check_agents();
        assert_eq!(flagged, vec!["a".to_string()]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_resets_stuck_counter() {
        let monitor = monitor(10);
        monitor.record_heartbeat("a", Some("t1"), "working");
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.check_agents();
        assert_eq!(monitor.heartbeat("a").unwrap().consecutive_stuck, 1);

        monitor.record_heartbeat("a", Some("t1"), "working");
        assert_eq!(monitor.heartbeat("a").unwrap().consecutive_stuck, 0);
        assert!(!monitor.is_stuck("a"));
    }

    #[tokio::test]
    async fn worker_dies_after_max_restarts() {
        let monitor = monitor(5);
        monitor.record_heartbeat("a", None, "working");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        monitor.on_stuck(Arc::new(move |_, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            monitor.check_agents();
        }

        // Three recoveries, then dead; no further callbacks fire.
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.heartbeat("a").unwrap().status, "dead");
    }

    #[tokio::test]
    async fn poll_loop_stops_cooperatively() {
        let monitor = Arc::new(monitor(5));
        monitor.record_heartbeat("a", Some("t1"), "working");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        monitor.on_stuck(Arc::new(move |_, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let handle = monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();
        handle.await.unwrap();

        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
