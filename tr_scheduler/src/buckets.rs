//! ABOUTME: In-memory time-slot map for load-balanced job placement
//! ABOUTME: Places jobs into 15-minute slots and preserves their rhythm

use crate::status::JobStatus;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Width of one placement slot
pub const SLOT_SECONDS: i64 = 900;

/// A job due within this window of now is pinned in place
pub const PROTECTION_WINDOW_SECONDS: i64 = 1800;

/// Minimum time between relocations of the same job
pub const PLACEMENT_COOLDOWN_SECONDS: i64 = 3600;

/// Default placement search horizon (24 h); longer intervals extend it
pub const DEFAULT_HORIZON_SECONDS: i64 = 86_400;

/// Slot key for an instant: floor(unix_seconds / 900)
pub fn slot_key(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(SLOT_SECONDS)
}

/// Start of a slot in UTC: slot_key * 900 seconds
pub fn slot_start(key: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(key * SLOT_SECONDS, 0).unwrap_or_default()
}

#[derive(Debug, Default)]
struct BucketState {
    /// slot_key -> number of jobs placed in that slot
    slots: HashMap<i64, u32>,
    /// job_id -> the one slot it currently occupies
    job_to_slot: HashMap<String, i64>,
    /// job_id -> last relocation time, for the placement cooldown
    last_moved: HashMap<String, DateTime<Utc>>,
}

impl BucketState {
    fn decrement(&mut self, key: i64) {
        if let Some(count) = self.slots.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.slots.remove(&key);
            }
        }
    }

    fn assign(&mut self, job_id: &str, key: i64) {
        if let Some(old) = self.job_to_slot.insert(job_id.to_string(), key) {
            self.decrement(old);
        }
        *self.slots.entry(key).or_insert(0) += 1;
    }

    /// Least-loaded slot in [start, end]; earliest wins ties
    fn least_loaded_in(&self, start: i64, end: i64) -> i64 {
        let mut best_key = start;
        let mut best_count = u32::MAX;
        for key in start..=end {
            let count = self.slots.get(&key).copied().unwrap_or(0);
            if count < best_count {
                best_key = key;
                best_count = count;
                if count == 0 {
                    break;
                }
            }
        }
        best_key
    }

    fn place_new(&mut self, job_id: &str, interval: Option<Duration>, now: DateTime<Utc>) -> i64 {
        // Cooldown makes repeated placement idempotent: a recently moved job
        // keeps its slot.
        if let (Some(&current), Some(&moved_at)) = (
            self.job_to_slot.get(job_id),
            self.last_moved.get(job_id),
        ) {
            if now - moved_at < Duration::seconds(PLACEMENT_COOLDOWN_SECONDS) {
                return current;
            }
        }

        let horizon = interval
            .map(|i| i.num_seconds().max(DEFAULT_HORIZON_SECONDS))
            .unwrap_or(DEFAULT_HORIZON_SECONDS);
        let start = slot_key(now);
        let end = slot_key(now + Duration::seconds(horizon));

        let key = self.least_loaded_in(start, end);
        self.assign(job_id, key);
        self.last_moved.insert(job_id.to_string(), now);
        key
    }

    fn can_move(
        &self,
        job_id: &str,
        status: JobStatus,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        if status == JobStatus::Running {
            return Err("job is running".to_string());
        }
        if let Some(next) = next_run_at {
            if next <= now + Duration::seconds(PROTECTION_WINDOW_SECONDS) {
                return Err("within protection window".to_string());
            }
        }
        if let Some(&moved_at) = self.last_moved.get(job_id) {
            if now - moved_at < Duration::seconds(PLACEMENT_COOLDOWN_SECONDS) {
                return Err("within placement cooldown".to_string());
            }
        }
        Ok(())
    }

    fn hourly_counts(&self, window_hours: u32, now: DateTime<Utc>) -> Vec<u32> {
        let start = slot_key(now);
        let slots_per_hour = (3600 / SLOT_SECONDS) as i64;
        (0..window_hours as i64)
            .map(|hour| {
                let from = start + hour * slots_per_hour;
                (from..from + slots_per_hour)
                    .map(|key| self.slots.get(&key).copied().unwrap_or(0))
                    .sum()
            })
            .collect()
    }
}

/// Evenness of a count distribution: 1 − variance normalized by the maximum
/// variance the same total could produce (everything in one bucket). 1.0 for
/// an empty or single-bucket distribution, 0.0 for full skew.
fn evenness_score(counts: &[u32]) -> f64 {
    if counts.len() <= 1 {
        return 1.0;
    }
    let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
    if total == 0 {
        return 1.0;
    }
    let n = counts.len() as f64;
    let mean = total as f64 / n;
    let variance = counts
        .iter()
        .map(|&c| {
            let d = f64::from(c) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let max_variance = mean * mean * (n - 1.0);
    (1.0 - variance / max_variance).clamp(0.0, 1.0)
}

/// A job relocated by a rebalance pass
#[derive(Debug, Clone, PartialEq)]
pub struct JobMove {
    pub job_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Outcome of a rebalance pass
#[derive(Debug, Clone, Default)]
pub struct RebalanceReport {
    pub moved: Vec<JobMove>,
    /// (job_id, reason) for jobs that failed the movability check
    pub skipped: Vec<(String, String)>,
    pub score: f64,
}

/// Hourly view of scheduled load
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub window_hours: u32,
    /// Jobs per hour, starting from the hour containing now
    pub hourly_counts: Vec<u32>,
    pub total: u64,
    /// Index into hourly_counts of the busiest hour
    pub peak_hour: usize,
    pub peak_count: u32,
    /// Evenness in [0, 1]; 1.0 = perfectly even
    pub score: f64,
}

/// Candidate row handed to `rebalance` by the scheduler
#[derive(Debug, Clone)]
pub struct RebalanceCandidate {
    pub job_id: String,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Per-process map of job placements across 15-minute slots.
///
/// Mutating operations take the internal write lock; queries take the read
/// lock. Callers that need rebalance serialized against placement get that
/// for free by routing both through this lock.
#[derive(Debug, Default)]
pub struct BucketMap {
    state: RwLock<BucketState>,
}

impl BucketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the least-loaded slot within [now, now + max(24h, interval)]
    /// and place the job there. Earliest slot wins ties. Returns the slot
    /// start; repeat calls within the cooldown return the current slot.
    pub fn place_new(
        &self,
        job_id: &str,
        interval: Option<Duration>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        slot_start(state.place_new(job_id, interval, now))
    }

    /// Advance the job by max(1, interval/slot) slots, preserving its phase.
    /// Repeats the advance until the slot lies in the future. Untracked jobs
    /// fall back to fresh placement.
    pub fn next_run_preserving_rhythm(
        &self,
        job_id: &str,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let current = match state.job_to_slot.get(job_id) {
            Some(&key) => key,
            None => return slot_start(state.place_new(job_id, Some(interval), now)),
        };

        let advance = (interval.num_seconds() / SLOT_SECONDS).max(1);
        let now_key = slot_key(now);
        let mut next = current + advance;
        while next <= now_key {
            next += advance;
        }

        state.assign(job_id, next);
        slot_start(next)
    }

    /// Whether the job may be relocated right now; the reason when not
    pub fn can_move(
        &self,
        job_id: &str,
        status: JobStatus,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (bool, Option<String>) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match state.can_move(job_id, status, next_run_at, now) {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        }
    }

    /// Relocate jobs out of overloaded slots to even out the window.
    /// Jobs failing the movability check are reported, not moved.
    pub fn rebalance(
        &self,
        candidates: &[RebalanceCandidate],
        window_hours: u32,
        now: DateTime<Utc>,
    ) -> RebalanceReport {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut report = RebalanceReport::default();

        let start = slot_key(now);
        let window_slots = window_hours as i64 * (3600 / SLOT_SECONDS);
        let end = start + window_slots.max(1) - 1;

        let tracked_in_window: u64 = state
            .slots
            .iter()
            .filter(|(key, _)| (start..=end).contains(key))
            .map(|(_, &count)| u64::from(count))
            .sum();
        let slot_count = (end - start + 1) as f64;
        let overload_threshold = (tracked_in_window as f64 / slot_count).ceil() as u32;

        for candidate in candidates {
            let current = match state.job_to_slot.get(&candidate.job_id) {
                Some(&key) if (start..=end).contains(&key) => key,
                _ => continue,
            };
            let load = state.slots.get(&current).copied().unwrap_or(0);
            if load <= overload_threshold.max(1) {
                continue;
            }

            if let Err(reason) = state.can_move(
                &candidate.job_id,
                candidate.status,
                candidate.next_run_at,
                now,
            ) {
                report.skipped.push((candidate.job_id.clone(), reason));
                continue;
            }

            let target = state.least_loaded_in(start, end);
            let target_load = state.slots.get(&target).copied().unwrap_or(0);
            if target_load + 1 >= load {
                continue;
            }

            state.assign(&candidate.job_id, target);
            state.last_moved.insert(candidate.job_id.clone(), now);
            report.moved.push(JobMove {
                job_id: candidate.job_id.clone(),
                from: slot_start(current),
                to: slot_start(target),
            });
        }

        report.score = evenness_score(&state.hourly_counts(window_hours, now));
        report
    }

    /// Hourly load over the window, with peak and evenness score
    pub fn distribution(&self, window_hours: u32, now: DateTime<Utc>) -> DistributionReport {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let hourly_counts = state.hourly_counts(window_hours, now);
        let total: u64 = hourly_counts.iter().map(|&c| u64::from(c)).sum();
        let (peak_hour, peak_count) = hourly_counts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(hour, &count)| (hour, count))
            .unwrap_or((0, 0));
        let score = evenness_score(&hourly_counts);

        DistributionReport {
            window_hours,
            hourly_counts,
            total,
            peak_hour,
            peak_count,
            score,
        }
    }

    /// Track a job already holding a next_run_at (startup rebuild)
    pub fn record_existing(&self, job_id: &str, next_run_at: DateTime<Utc>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let key = slot_key(next_run_at);
        state.assign(job_id, key);
    }

    /// Forget a job entirely
    pub fn remove(&self, job_id: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = state.job_to_slot.remove(job_id) {
            state.decrement(key);
        }
        state.last_moved.remove(job_id);
    }

    /// Number of tracked jobs
    pub fn tracked_jobs(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.job_to_slot.len()
    }

    /// Slot start the job currently occupies, if tracked
    pub fn slot_of(&self, job_id: &str) -> Option<DateTime<Utc>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.job_to_slot.get(job_id).map(|&key| slot_start(key))
    }

    /// Core invariant: slot counts sum to the number of tracked jobs
    pub fn invariant_holds(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let sum: u64 = state.slots.values().map(|&c| u64::from(c)).sum();
        sum == state.job_to_slot.len() as u64
    }
}
