//! Access-driven activation with exponential decay and Hebbian co-activation.
//!
//! Every access boosts a record's activation; between accesses it decays as
//! `a(t) = a0 · exp(−λ·Δt)`. Records accessed together strengthen a symmetric
//! link by `η · a_i · a_j`, capped at 1. State is in-memory and sharded per
//! owner; it is derived from usage and starts empty on every open.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::sync::{lock, read, write};

#[derive(Debug, Clone, Copy)]
pub struct ActivationParams {
    pub boost: f64,
    pub learning_rate: f64,
    /// Per second.
    pub decay_rate: f64,
}

impl Default for ActivationParams {
    fn default() -> Self {
        Self {
            boost: 1.0,
            learning_rate: 0.1,
            decay_rate: 1e-5,
        }
    }
}

impl From<&crate::config::ActivationConfig> for ActivationParams {
    fn from(config: &crate::config::ActivationConfig) -> Self {
        Self {
            boost: config.boost,
            learning_rate: config.learning_rate,
            decay_rate: config.decay_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationState {
    pub level: f64,
    pub last_decay_at: DateTime<Utc>,
    /// Partner record id → link strength in `[0, 1]`.
    pub co_activation: HashMap<String, f64>,
}

impl ActivationState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            level: 0.0,
            last_decay_at: now,
            co_activation: HashMap::new(),
        }
    }

    fn level_at(&self, now: DateTime<Utc>, decay_rate: f64) -> f64 {
        let elapsed = seconds_between(self.last_decay_at, now);
        if elapsed <= 0.0 {
            return self.level;
        }
        (self.level * (-decay_rate * elapsed).exp()).max(0.0)
    }

    fn decay_to(&mut self, now: DateTime<Utc>, decay_rate: f64) {
        if now <= self.last_decay_at {
            return;
        }
        self.level = self.level_at(now, decay_rate);
        self.last_decay_at = now;
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6
}

#[derive(Debug, Default)]
struct Shard {
    states: HashMap<String, ActivationState>,
}

impl Shard {
    fn boost(&mut self, id: &str, now: DateTime<Utc>, params: &ActivationParams) {
        let state = self
            .states
            .entry(id.to_string())
            .or_insert_with(|| ActivationState::new(now));
        state.decay_to(now, params.decay_rate);
        state.level += params.boost;
    }

    /// One Hebbian step over every unordered pair in `window`.
    fn hebbian(&mut self, window: &[&str], now: DateTime<Utc>, params: &ActivationParams) {
        for id in window {
            if let Some(state) = self.states.get_mut(*id) {
                state.decay_to(now, params.decay_rate);
            }
        }
        for (i, a) in window.iter().enumerate() {
            for b in &window[i + 1..] {
                let (Some(sa), Some(sb)) = (self.states.get(*a), self.states.get(*b)) else {
                    continue;
                };
                let delta = params.learning_rate * sa.level * sb.level;
                if delta <= 0.0 {
                    continue;
                }
                let current = sa.co_activation.get(*b).copied().unwrap_or(0.0);
                let updated = (current + delta).min(1.0);
                if let Some(sa) = self.states.get_mut(*a) {
                    sa.co_activation.insert(b.to_string(), updated);
                }
                if let Some(sb) = self.states.get_mut(*b) {
                    sb.co_activation.insert(a.to_string(), updated);
                }
            }
        }
    }
}

/// Deduplicated, order-stable access window.
fn window<'a>(id: Option<&'a str>, others: &[&'a str]) -> Vec<&'a str> {
    let mut seen = BTreeSet::new();
    id.into_iter()
        .chain(others.iter().copied())
        .filter(|x| !x.is_empty() && seen.insert(*x))
        .collect()
}

pub struct ActivationEngine {
    params: ActivationParams,
    shards: RwLock<HashMap<String, Arc<Mutex<Shard>>>>,
}

impl ActivationEngine {
    pub fn new(params: ActivationParams) -> Self {
        Self {
            params,
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> ActivationParams {
        self.params
    }

    fn shard(&self, owner: &str) -> Option<Arc<Mutex<Shard>>> {
        read(&self.shards).get(owner).cloned()
    }

    fn shard_or_create(&self, owner: &str) -> Arc<Mutex<Shard>> {
        if let Some(shard) = self.shard(owner) {
            return shard;
        }
        Arc::clone(write(&self.shards).entry(owner.to_string()).or_default())
    }

    pub fn record_access(&self, owner: &str, id: &str, co_accessed_with: &[&str]) {
        self.record_access_at(owner, id, co_accessed_with, Utc::now());
    }

    /// Decay-then-boost `id`, then strengthen links across `{id} ∪ co_accessed_with`.
    pub fn record_access_at(&self, owner: &str, id: &str, co_accessed_with: &[&str], now: DateTime<Utc>) {
        let shard = self.shard_or_create(owner);
        let mut shard = lock(&shard);
        shard.boost(id, now, &self.params);
        let window = window(Some(id), co_accessed_with);
        shard.hebbian(&window, now, &self.params);
    }

    pub fn record_recall(&self, owner: &str, ids: &[&str]) {
        self.record_recall_at(owner, ids, Utc::now());
    }

    /// Boost every recalled id, then apply one Hebbian step per pair.
    pub fn record_recall_at(&self, owner: &str, ids: &[&str], now: DateTime<Utc>) {
        let window = window(None, ids);
        if window.is_empty() {
            return;
        }
        let shard = self.shard_or_create(owner);
        let mut shard = lock(&shard);
        for id in &window {
            shard.boost(id, now, &self.params);
        }
        shard.hebbian(&window, now, &self.params);
    }

    /// Apply decay up to `now` and return the new level. A `now` earlier than
    /// the last decay leaves the state untouched.
    pub fn decay(&self, owner: &str, id: &str, now: DateTime<Utc>) -> Option<f64> {
        let shard = self.shard(owner)?;
        let mut shard = lock(&shard);
        let state = shard.states.get_mut(id)?;
        state.decay_to(now, self.params.decay_rate);
        Some(state.level)
    }

    /// Current activation without mutating state; 0 for unknown records.
    pub fn activation_at(&self, owner: &str, id: &str, now: DateTime<Utc>) -> f64 {
        let Some(shard) = self.shard(owner) else {
            return 0.0;
        };
        let shard = lock(&shard);
        shard
            .states
            .get(id)
            .map(|s| s.level_at(now, self.params.decay_rate))
            .unwrap_or(0.0)
    }

    /// Activation of many records at one instant, taken under a single lock.
    pub fn snapshot(&self, owner: &str, ids: &[&str], now: DateTime<Utc>) -> HashMap<String, f64> {
        let shard = self.shard(owner);
        let guard = shard.as_ref().map(|s| lock(s));
        ids.iter()
            .map(|id| {
                let level = guard
                    .as_ref()
                    .and_then(|g| g.states.get(*id))
                    .map(|s| s.level_at(now, self.params.decay_rate))
                    .unwrap_or(0.0);
                (id.to_string(), level)
            })
            .collect()
    }

    /// Add `amount` (possibly negative) to the decayed activation, floored at 0.
    pub fn nudge(&self, owner: &str, id: &str, amount: f64, now: DateTime<Utc>) -> f64 {
        let shard = self.shard_or_create(owner);
        let mut shard = lock(&shard);
        let state = shard
            .states
            .entry(id.to_string())
            .or_insert_with(|| ActivationState::new(now));
        state.decay_to(now, self.params.decay_rate);
        state.level = (state.level + amount).max(0.0);
        state.level
    }

    pub fn co_activation(&self, owner: &str, a: &str, b: &str) -> f64 {
        let Some(shard) = self.shard(owner) else {
            return 0.0;
        };
        let shard = lock(&shard);
        shard
            .states
            .get(a)
            .and_then(|s| s.co_activation.get(b).copied())
            .unwrap_or(0.0)
    }

    /// Linked partners of `id`, strongest first, ties by id.
    pub fn associations(&self, owner: &str, id: &str) -> Vec<(String, f64)> {
        let Some(shard) = self.shard(owner) else {
            return Vec::new();
        };
        let shard = lock(&shard);
        let mut links: Vec<(String, f64)> = shard
            .states
            .get(id)
            .map(|s| s.co_activation.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        links.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        links
    }

    /// Drop `id` and every link pointing at it.
    pub fn remove(&self, owner: &str, id: &str) -> bool {
        let Some(shard) = self.shard(owner) else {
            return false;
        };
        let mut shard = lock(&shard);
        let Some(state) = shard.states.remove(id) else {
            return false;
        };
        for partner in state.co_activation.keys() {
            if let Some(p) = shard.states.get_mut(partner) {
                p.co_activation.remove(id);
            }
        }
        true
    }

    /// Put back a state taken with [`state`](Self::state) before a
    /// [`remove`](Self::remove). Links to partners that are gone since are dropped.
    pub fn restore(&self, owner: &str, id: &str, mut state: ActivationState) {
        let shard = self.shard_or_create(owner);
        let mut shard = lock(&shard);
        state.co_activation.retain(|partner, _| shard.states.contains_key(partner));
        for (partner, strength) in &state.co_activation {
            if let Some(p) = shard.states.get_mut(partner) {
                p.co_activation.insert(id.to_string(), *strength);
            }
        }
        shard.states.insert(id.to_string(), state);
    }

    pub fn state(&self, owner: &str, id: &str) -> Option<ActivationState> {
        let shard = self.shard(owner)?;
        let shard = lock(&shard);
        shard.states.get(id).cloned()
    }

    /// Number of tracked records for `owner`.
    pub fn len(&self, owner: &str) -> usize {
        self.shard(owner).map(|s| lock(&s).states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        read(&self.shards).values().all(|s| lock(s).states.is_empty())
    }
}

impl Default for ActivationEngine {
    fn default() -> Self {
        Self::new(ActivationParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> ActivationEngine {
        ActivationEngine::default()
    }

    #[test]
    fn access_boosts_activation() {
        let e = engine();
        let now = Utc::now();
        e.record_access_at("u", "a", &[], now);
        assert!((e.activation_at("u", "a", now) - 1.0).abs() < 1e-12);
        e.record_access_at("u", "a", &[], now);
        assert!((e.activation_at("u", "a", now) - 2.0).abs() < 1e-12);
        assert_eq!(e.activation_at("u", "unknown", now), 0.0);
        assert_eq!(e.activation_at("other", "a", now), 0.0);
    }

    #[test]
    fn decay_follows_exponential() {
        let e = engine();
        let t0 = Utc::now();
        e.record_access_at("u", "a", &[], t0);
        let t1 = t0 + Duration::seconds(100_000);
        let expected = (-1e-5f64 * 100_000.0).exp();
        assert!((e.activation_at("u", "a", t1) - expected).abs() < 1e-9);
        assert!((e.decay("u", "a", t1).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn decay_into_the_past_is_noop() {
        let e = engine();
        let t0 = Utc::now();
        e.record_access_at("u", "a", &[], t0);
        let before = e.state("u", "a").unwrap();
        e.decay("u", "a", t0 - Duration::hours(1));
        let after = e.state("u", "a").unwrap();
        assert_eq!(before.level, after.level);
        assert_eq!(before.last_decay_at, after.last_decay_at);
    }

    #[test]
    fn co_access_builds_symmetric_links() {
        let e = engine();
        let now = Utc::now();
        e.record_recall_at("u", &["a", "b"], now);
        // both at 1.0 after boost: Δw = 0.1 · 1 · 1
        assert!((e.co_activation("u", "a", "b") - 0.1).abs() < 1e-12);
        assert_eq!(e.co_activation("u", "a", "b"), e.co_activation("u", "b", "a"));
    }

    #[test]
    fn link_strength_is_capped() {
        let e = engine();
        let now = Utc::now();
        for _ in 0..50 {
            e.record_recall_at("u", &["a", "b"], now);
        }
        assert_eq!(e.co_activation("u", "a", "b"), 1.0);
    }

    #[test]
    fn record_access_uses_existing_partner_activation() {
        let e = engine();
        let now = Utc::now();
        e.record_access_at("u", "a", &["b"], now);
        // b was never activated, so no link forms
        assert_eq!(e.co_activation("u", "a", "b"), 0.0);
        e.record_access_at("u", "b", &[], now);
        e.record_access_at("u", "a", &["b"], now);
        // a = 2, b = 1 → Δw = 0.2
        assert!((e.co_activation("u", "a", "b") - 0.2).abs() < 1e-12);
    }

    #[test]
    fn remove_cleans_partner_links() {
        let e = engine();
        let now = Utc::now();
        e.record_recall_at("u", &["a", "b", "c"], now);
        assert_eq!(e.associations("u", "a").len(), 2);
        assert!(e.remove("u", "b"));
        assert!(!e.remove("u", "b"));
        assert_eq!(e.associations("u", "a"), vec![("c".to_string(), 0.1)]);
        assert_eq!(e.len("u"), 2);
    }

    #[test]
    fn restore_brings_back_level_and_links() {
        let e = engine();
        e.record_access("u", "a", &[]);
        e.record_access("u", "b", &["a"]);
        let strength = e.co_activation("u", "a", "b");
        let saved = e.state("u", "a").unwrap();

        assert!(e.remove("u", "a"));
        assert_eq!(e.co_activation("u", "b", "a"), 0.0);

        e.restore("u", "a", saved.clone());
        assert_eq!(e.state("u", "a").unwrap().level, saved.level);
        assert_eq!(e.co_activation("u", "a", "b"), strength);
        assert_eq!(e.co_activation("u", "b", "a"), strength);
    }

    #[test]
    fn nudge_floors_at_zero() {
        let e = engine();
        let now = Utc::now();
        assert!((e.nudge("u", "a", 0.5, now) - 0.5).abs() < 1e-12);
        assert_eq!(e.nudge("u", "a", -3.0, now), 0.0);
    }

    #[test]
    fn snapshot_reads_many() {
        let e = engine();
        let now = Utc::now();
        e.record_access_at("u", "a", &[], now);
        let snap = e.snapshot("u", &["a", "b"], now);
        assert!((snap["a"] - 1.0).abs() < 1e-12);
        assert_eq!(snap["b"], 0.0);
    }
}
