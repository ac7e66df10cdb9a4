// Execution host inventory for scale-down

//! # Capacity Manager
//!
//! Jobs run on a fleet of execution hosts billed by the started hour. The
//! scheduler's scale-down task asks the capacity manager for the fleet and
//! terminates at most one idle host per run, picking a host that is about to
//! start a new billing hour.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::{Result, SchedulerError};

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHost {
    pub host_id: String,
    pub launched_at: DateTime<Utc>,
    pub running_tasks: u32,
    pub pending_tasks: u32,
    /// Hosts that are draining or already stopping are not candidates
    pub active: bool,
}

impl ExecutionHost {
    pub fn new(host_id: impl Into<String>, launched_at: DateTime<Utc>) -> Self {
        Self {
            host_id: host_id.into(),
            launched_at,
            running_tasks: 0,
            pending_tasks: 0,
            active: true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active && self.running_tasks == 0 && self.pending_tasks == 0
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.launched_at).num_seconds().max(0)
    }
}

/// True when `uptime + window` crosses into the next started hour
pub fn is_near_hour_boundary(uptime_secs: i64, window_secs: i64) -> bool {
    uptime_secs / SECONDS_PER_HOUR != (uptime_secs + window_secs) / SECONDS_PER_HOUR
}

/// Pick the idle host to terminate, if any.
///
/// Never picks when one idle host or fewer remain, so the fleet keeps a warm
/// floor.
pub fn select_host_to_terminate(
    hosts: &[ExecutionHost],
    now: DateTime<Utc>,
    window_secs: i64,
) -> Option<&ExecutionHost> {
    let idle: Vec<&ExecutionHost> = hosts.iter().filter(|h| h.is_idle()).collect();
    if idle.len() <= 1 {
        return None;
    }
    idle.into_iter()
        .find(|h| is_near_hour_boundary(h.uptime_secs(now), window_secs))
}

#[async_trait::async_trait]
pub trait CapacityManager: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<ExecutionHost>>;

    async fn terminate_host(&self, host_id: &str) -> Result<()>;
}

/// In-memory fleet for development and testing
#[derive(Default)]
pub struct InMemoryCapacityManager {
    hosts: RwLock<Vec<ExecutionHost>>,
    terminated: RwLock<Vec<String>>,
}

impl InMemoryCapacityManager {
    pub fn new(hosts: Vec<ExecutionHost>) -> Self {
        Self {
            hosts: RwLock::new(hosts),
            terminated: RwLock::new(Vec::new()),
        }
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.read().map(|t| t.clone()).unwrap_or_default()
    }
}

fn poisoned() -> SchedulerError {
    SchedulerError::Internal("capacity lock poisoned".to_string())
}

#[async_trait::async_trait]
impl CapacityManager for InMemoryCapacityManager {
    async fn list_hosts(&self) -> Result<Vec<ExecutionHost>> {
        Ok(self.hosts.read().map_err(|_| poisoned())?.clone())
    }

    async fn terminate_host(&self, host_id: &str) -> Result<()> {
        let mut hosts = self.hosts.write().map_err(|_| poisoned())?;
        let before = hosts.len();
        hosts.retain(|h| h.host_id != host_id);
        if hosts.len() == before {
            return Err(SchedulerError::NotFound(format!("host {}", host_id)));
        }
        self.terminated
            .write()
            .map_err(|_| poisoned())?
            .push(host_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn host(id: &str, now: DateTime<Utc>, uptime_secs: i64) -> ExecutionHost {
        ExecutionHost::new(id, now - Duration::seconds(uptime_secs))
    }

    #[test]
    fn test_hour_boundary() {
        assert!(is_near_hour_boundary(3500, 300));
        assert!(!is_near_hour_boundary(3700, 300));
        assert!(is_near_hour_boundary(7100, 300));
        assert!(!is_near_hour_boundary(0, 300));
    }

    #[test]
    fn test_keeps_last_idle_host() {
        let now = Utc::now();
        let mut busy = host("busy", now, 3500);
        busy.running_tasks = 2;
        let hosts = vec![busy, host("idle", now, 3500)];

        assert!(select_host_to_terminate(&hosts, now, 300).is_none());
    }

    #[test]
    fn test_picks_idle_host_near_boundary() {
        let now = Utc::now();
        let mut pending = host("pending", now, 3550);
        pending.pending_tasks = 1;
        let hosts = vec![
            host("fresh", now, 600),
            pending,
            host("due", now, 3450),
            host("also_due", now, 7150),
        ];

        let chosen = select_host_to_terminate(&hosts, now, 300).unwrap();
        assert_eq!(chosen.host_id, "due");
    }

    #[test]
    fn test_inactive_hosts_are_not_idle() {
        let now = Utc::now();
        let mut draining = host("draining", now, 3500);
        draining.active = false;
        let hosts = vec![draining, host("idle", now, 3500)];

        assert!(select_host_to_terminate(&hosts, now, 300).is_none());
    }

    #[test]
    fn test_terminate_removes_host() {
        let now = Utc::now();
        let manager = InMemoryCapacityManager::new(vec![host("a", now, 10), host("b", now, 10)]);

        tokio_test::block_on(async {
            assert_ok!(manager.terminate_host("a").await);
            assert_eq!(manager.list_hosts().await.unwrap().len(), 1);
            assert_err!(manager.terminate_host("a").await);
        });
        assert_eq!(manager.terminated(), vec!["a".to_string()]);
    }
}
