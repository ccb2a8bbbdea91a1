//! Sliding-window counters for outbound data flows
//!
//! Counters are keyed by `(tenant, session, resource)` and updated
//! atomically under the map's per-key lock, so concurrent requests from the
//! same session never lose an update.

use crate::tenant::TenantId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counter key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub tenant_id: TenantId,
    pub session_id: String,
    pub resource: String,
}

impl CounterKey {
    pub fn new(tenant_id: TenantId, session_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            tenant_id,
            session_id: session_id.into(),
            resource: resource.into(),
        }
    }
}

/// One outbound response as seen by the counters
#[derive(Debug, Clone)]
pub struct Observation {
    pub at: Instant,
    pub records: u64,
    /// Record identifiers in response order
    pub identifiers: Vec<u64>,
}

/// Window state after applying an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    /// Records returned in the window, this observation included
    pub total_records: u64,
    /// Requests in the window, this observation included
    pub requests: usize,
    /// Length of the current run of strictly sequential identifiers
    pub sequential_run: usize,
}

/// Atomic per-key window store
pub trait CounterStore: Send + Sync {
    /// Apply an observation and return the resulting window.
    fn observe(&self, key: &CounterKey, observation: &Observation, window: Duration) -> WindowSnapshot;

    /// Forget every window of one session
    fn clear_session(&self, tenant_id: &TenantId, session_id: &str);

    /// Drop windows that saw no traffic for longer than `window`. Returns
    /// how many were dropped.
    fn prune(&self, now: Instant, window: Duration) -> usize;
}

#[derive(Debug, Default)]
struct WindowState {
    /// (time, records) per request, oldest first
    entries: VecDeque<(Instant, u64)>,
    total: u64,
    last_identifier: Option<u64>,
    last_identifier_at: Option<Instant>,
    run: usize,
}

impl WindowState {
    fn apply(&mut self, observation: &Observation, window: Duration) -> WindowSnapshot {
        let now = observation.at;
        while let Some(&(at, records)) = self.entries.front() {
            if now.saturating_duration_since(at) <= window {
                break;
            }
            self.entries.pop_front();
            self.total = self.total.saturating_sub(records);
        }
        self.entries.push_back((now, observation.records));
        self.total = self.total.saturating_add(observation.records);

        if self
            .last_identifier_at
            .is_some_and(|at| now.saturating_duration_since(at) > window)
        {
            self.last_identifier = None;
            self.run = 0;
        }
        for &id in &observation.identifiers {
            let sequential = self
                .last_identifier
                .and_then(|last| last.checked_add(1))
                .is_some_and(|next| next == id);
            self.run = if sequential { self.run + 1 } else { 1 };
            self.last_identifier = Some(id);
            self.last_identifier_at = Some(now);
        }

        WindowSnapshot {
            total_records: self.total,
            requests: self.entries.len(),
            sequential_run: self.run,
        }
    }
}

/// In-process counter store (DashMap entry API for per-key locking)
#[derive(Debug, Default)]
pub struct WindowCounterStore {
    windows: DashMap<CounterKey, WindowState>,
}

impl WindowCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl CounterStore for WindowCounterStore {
    fn observe(&self, key: &CounterKey, observation: &Observation, window: Duration) -> WindowSnapshot {
        self.windows
            .entry(key.clone())
            .or_default()
            .apply(observation, window)
    }

    fn clear_session(&self, tenant_id: &TenantId, session_id: &str) {
        self.windows
            .retain(|key, _| !(&key.tenant_id == tenant_id && key.session_id == session_id));
    }

    fn prune(&self, now: Instant, window: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| {
            state
                .entries
                .back()
                .is_some_and(|&(at, _)| now.saturating_duration_since(at) <= window)
        });
        before.saturating_sub(self.windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    fn key(session: &str) -> CounterKey {
        CounterKey::new(TenantId::new("malmo").unwrap(), session, "students")
    }

    fn obs(at: Instant, records: u64, ids: &[u64]) -> Observation {
        Observation {
            at,
            records,
            identifiers: ids.to_vec(),
        }
    }

    #[test]
    fn test_totals_slide() {
        let store = WindowCounterStore::new();
        let t0 = Instant::now();
        store.observe(&key("s"), &obs(t0, 10, &[]), WINDOW);
        let snap = store.observe(&key("s"), &obs(t0 + Duration::from_secs(30), 5, &[]), WINDOW);
        assert_eq!(snap.total_records, 15);
        assert_eq!(snap.requests, 2);

        // t0 falls out of the window, t0+30s stays in
        let snap = store.observe(&key("s"), &obs(t0 + Duration::from_secs(70), 1, &[]), WINDOW);
        assert_eq!(snap.total_records, 6);
        assert_eq!(snap.requests, 2);

        let snap = store.observe(&key("s"), &obs(t0 + Duration::from_secs(131), 2, &[]), WINDOW);
        assert_eq!(snap.total_records, 2);
        assert_eq!(snap.requests, 1);
    }

    #[test]
    fn test_sequential_run_across_requests() {
        let store = WindowCounterStore::new();
        let t0 = Instant::now();
        store.observe(&key("s"), &obs(t0, 3, &[1, 2, 3]), WINDOW);
        let snap = store.observe(&key("s"), &obs(t0, 2, &[4, 5]), WINDOW);
        assert_eq!(snap.sequential_run, 5);

        let snap = store.observe(&key("s"), &obs(t0, 1, &[9]), WINDOW);
        assert_eq!(snap.sequential_run, 1);
    }

    #[test]
    fn test_run_resets_after_quiet_window() {
        let store = WindowCounterStore::new();
        let t0 = Instant::now();
        store.observe(&key("s"), &obs(t0, 2, &[1, 2]), WINDOW);
        let snap = store.observe(&key("s"), &obs(t0 + Duration::from_secs(120), 1, &[3]), WINDOW);
        assert_eq!(snap.sequential_run, 1);
    }

    #[test]
    fn test_sessions_are_separate_and_clearable() {
        let store = WindowCounterStore::new();
        let t0 = Instant::now();
        store.observe(&key("a"), &obs(t0, 10, &[]), WINDOW);
        let snap = store.observe(&key("b"), &obs(t0, 1, &[]), WINDOW);
        assert_eq!(snap.total_records, 1);

        store.clear_session(&TenantId::new("malmo").unwrap(), "a");
        assert_eq!(store.len(), 1);
        assert_eq!(store.prune(t0 + Duration::from_secs(61), WINDOW), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_updates_not_lost() {
        let store = Arc::new(WindowCounterStore::new());
        let t0 = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.observe(&key("s"), &obs(t0, 1, &[]), WINDOW);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = store.observe(&key("s"), &obs(t0, 0, &[]), WINDOW);
        assert_eq!(snap.total_records, 800);
    }
}
