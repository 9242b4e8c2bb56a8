//! Runtime memory manager for long-lived interpreters
//!
//! Interpreters hosted in a worker (for example a WASM-hosted Python) keep
//! their own heap that the host cannot collect. The manager watches the
//! samples the worker reports and decides how aggressively to clean up after
//! each execution.

use livepad_common::MemoryReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const MB: u64 = 1024 * 1024;

/// Thresholds and cadence for cleanups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "MemoryConfig::default_soft")]
    pub soft_limit_bytes: u64,
    #[serde(default = "MemoryConfig::default_hard")]
    pub hard_limit_bytes: u64,
    #[serde(default = "MemoryConfig::default_critical")]
    pub critical_limit_bytes: u64,
    #[serde(default = "MemoryConfig::default_object_soft")]
    pub object_soft_limit: u64,
    #[serde(default = "MemoryConfig::default_object_hard")]
    pub object_hard_limit: u64,
    /// Light cleanup every N executions
    #[serde(default = "MemoryConfig::default_light_every")]
    pub light_every: u64,
    /// Full cleanup every M executions
    #[serde(default = "MemoryConfig::default_full_every")]
    pub full_every: u64,
    /// Names a namespace reset must keep
    #[serde(default = "MemoryConfig::default_preserved")]
    pub preserved_names: Vec<String>,
}

impl MemoryConfig {
    fn default_soft() -> u64 {
        256 * MB
    }

    fn default_hard() -> u64 {
        512 * MB
    }

    fn default_critical() -> u64 {
        1024 * MB
    }

    fn default_object_soft() -> u64 {
        250_000
    }

    fn default_object_hard() -> u64 {
        1_000_000
    }

    fn default_light_every() -> u64 {
        10
    }

    fn default_full_every() -> u64 {
        50
    }

    fn default_preserved() -> Vec<String> {
        [
            "__builtins__",
            "__name__",
            "__doc__",
            "__package__",
            "__loader__",
            "__spec__",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit_bytes: Self::default_soft(),
            hard_limit_bytes: Self::default_hard(),
            critical_limit_bytes: Self::default_critical(),
            object_soft_limit: Self::default_object_soft(),
            object_hard_limit: Self::default_object_hard(),
            light_every: Self::default_light_every(),
            full_every: Self::default_full_every(),
            preserved_names: Self::default_preserved(),
        }
    }
}

/// How much cleanup an execution calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupLevel {
    None,
    /// Garbage collection only
    Light,
    /// Namespace reset keeping the allow-list
    Full,
    /// Escalate: cleanups cannot reclaim enough, restart the interpreter
    Critical,
}

impl fmt::Display for CleanupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupLevel::None => "none",
            CleanupLevel::Light => "light",
            CleanupLevel::Full => "full",
            CleanupLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub heap_used: u64,
    pub heap_total: u64,
    pub executions_since_cleanup: u64,
    pub interpreter_object_count: u64,
    pub total_executions: u64,
    pub last_cleanup: Option<CleanupLevel>,
}

/// Called when an execution crosses the critical threshold
pub type EscalationHandler = Arc<dyn Fn(&MemoryStats) + Send + Sync>;

pub struct MemoryManager {
    config: MemoryConfig,
    stats: MemoryStats,
    on_critical: Option<EscalationHandler>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            stats: MemoryStats::default(),
            on_critical: None,
        }
    }

    pub fn with_escalation(mut self, handler: EscalationHandler) -> Self {
        self.on_critical = Some(handler);
        self
    }

    /// Record the latest worker sample
    pub fn observe(&mut self, report: MemoryReport) {
        self.stats.heap_used = report.heap_used;
        self.stats.heap_total = report.heap_total.max(report.heap_used);
        self.stats.interpreter_object_count = report.object_count;
    }

    /// Count an execution and decide the cleanup level.
    pub fn after_execution(&mut self) -> CleanupLevel {
        self.stats.total_executions += 1;
        self.stats.executions_since_cleanup += 1;

        let level = self.decide();
        if level != CleanupLevel::None {
            self.stats.executions_since_cleanup = 0;
            self.stats.last_cleanup = Some(level);
            tracing::debug!(
                %level,
                heap_used = self.stats.heap_used,
                objects = self.stats.interpreter_object_count,
                "Memory cleanup requested"
            );
        }
        if level == CleanupLevel::Critical {
            tracing::warn!(
                heap_used = self.stats.heap_used,
                limit = self.config.critical_limit_bytes,
                "Interpreter memory critical, escalating"
            );
            if let Some(handler) = &self.on_critical {
                handler(&self.stats);
            }
        }
        level
    }

    fn decide(&self) -> CleanupLevel {
        let c = &self.config;
        let s = &self.stats;
        if s.heap_used >= c.critical_limit_bytes {
            CleanupLevel::Critical
        } else if s.heap_used >= c.hard_limit_bytes
            || s.interpreter_object_count >= c.object_hard_limit
        {
            CleanupLevel::Full
        } else if s.heap_used >= c.soft_limit_bytes
            || s.interpreter_object_count >= c.object_soft_limit
        {
            CleanupLevel::Light
        } else if c.full_every > 0 && s.total_executions % c.full_every == 0 {
            CleanupLevel::Full
        } else if c.light_every > 0 && s.total_executions % c.light_every == 0 {
            CleanupLevel::Light
        } else {
            CleanupLevel::None
        }
    }

    /// Forget samples after the interpreter was restarted
    pub fn reset(&mut self) {
        self.stats.heap_used = 0;
        self.stats.heap_total = 0;
        self.stats.interpreter_object_count = 0;
        self.stats.executions_since_cleanup = 0;
    }

    pub fn preserved_names(&self) -> &[String] {
        &self.config.preserved_names
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> MemoryConfig {
        MemoryConfig {
            soft_limit_bytes: 100,
            hard_limit_bytes: 200,
            critical_limit_bytes: 300,
            object_soft_limit: 1_000,
            object_hard_limit: 5_000,
            light_every: 3,
            full_every: 6,
            preserved_names: vec!["__builtins__".into()],
        }
    }

    fn sample(heap_used: u64, object_count: u64) -> MemoryReport {
        MemoryReport {
            heap_used,
            heap_total: heap_used * 2,
            object_count,
        }
    }

    #[test]
    fn test_periodic_cleanups() {
        let mut manager = MemoryManager::new(config());
        let levels: Vec<CleanupLevel> = (0..6).map(|_| manager.after_execution()).collect();
        assert_eq!(
            levels,
            vec![
                CleanupLevel::None,
                CleanupLevel::None,
                CleanupLevel::Light,
                CleanupLevel::None,
                CleanupLevel::None,
                CleanupLevel::Full,
            ]
        );
        assert_eq!(manager.stats().executions_since_cleanup, 0);
        assert_eq!(manager.stats().total_executions, 6);
    }

    #[test]
    fn test_thresholds_take_priority_over_counters() {
        let mut manager = MemoryManager::new(config());
        manager.observe(sample(150, 0));
        assert_eq!(manager.after_execution(), CleanupLevel::Light);

        manager.observe(sample(10, 6_000));
        assert_eq!(manager.after_execution(), CleanupLevel::Full);

        manager.observe(sample(250, 0));
        assert_eq!(manager.after_execution(), CleanupLevel::Full);

        manager.observe(sample(10, 2_000));
        assert_eq!(manager.after_execution(), CleanupLevel::Light);
    }

    #[test]
    fn test_critical_invokes_escalation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut manager = MemoryManager::new(config()).with_escalation(Arc::new(move |stats| {
            assert!(stats.heap_used >= 300);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        manager.observe(sample(400, 0));
        assert_eq!(manager.after_execution(), CleanupLevel::Critical);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().last_cleanup, Some(CleanupLevel::Critical));

        manager.reset();
        assert_eq!(manager.after_execution(), CleanupLevel::None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
