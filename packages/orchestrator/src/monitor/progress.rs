//! Per-task progress tracking, throughput and ETA.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::ProgressData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub at: DateTime<Utc>,
    pub progress: ProgressData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub task_id: String,
    pub progress: ProgressData,
    pub samples: usize,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Items per second between the last two samples
    pub instantaneous_throughput: Option<f64>,
    /// Items per second across the averaging window
    pub average_throughput: Option<f64>,
    /// Omitted while average throughput is zero
    pub eta_seconds: Option<f64>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

pub struct ProgressMonitor {
    history_size: usize,
    window: usize,
    tasks: Mutex<HashMap<String, VecDeque<ProgressSample>>>,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new(100, 10)
    }
}

impl ProgressMonitor {
    /// Keep `history_size` samples per task; average throughput over the last `window`.
    pub fn new(history_size: usize, window: usize) -> Self {
        Self {
            history_size: history_size.max(2),
            window: window.max(2),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(
        &self,
        task_id: &str,
        current: u64,
        total: u64,
        description: impl Into<String>,
    ) -> ProgressSummary {
        self.record(task_id, ProgressData::new(current, total, description), Utc::now())
    }

    /// Record a sample taken at `at`.
    pub fn record(&self, task_id: &str, progress: ProgressData, at: DateTime<Utc>) -> ProgressSummary {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let history = tasks.entry(task_id.to_string()).or_default();
        history.push_back(ProgressSample { at, progress });
        while history.len() > self.history_size {
            history.pop_front();
        }
        summarize(task_id, history, self.window)
    }

    pub fn summary(&self, task_id: &str) -> Option<ProgressSummary> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .get(task_id)
            .filter(|history| !history.is_empty())
            .map(|history| summarize(task_id, history, self.window))
    }

    pub fn summaries(&self) -> Vec<ProgressSummary> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<_> = tasks
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(task_id, history)| summarize(task_id, history, self.window))
            .collect();
        summaries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        summaries
    }

    pub fn history(&self, task_id: &str) -> Vec<ProgressSample> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .get(task_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
            .is_some()
    }

    /// Drop tasks whose last update is older than `cutoff`.
    pub fn forget_stale(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, history| history.back().is_some_and(|sample| sample.at >= cutoff));
        before - tasks.len()
    }
}

fn rate(from: &ProgressSample, to: &ProgressSample) -> Option<f64> {
    let seconds = (to.at - from.at).num_milliseconds() as f64 / 1000.0;
    if seconds <= 0.0 {
        return None;
    }
    let done = to.progress.current as f64 - from.progress.current as f64;
    Some((done / seconds).max(0.0))
}

fn summarize(task_id: &str, history: &VecDeque<ProgressSample>, window: usize) -> ProgressSummary {
    let first = &history[0];
    let last = &history[history.len() - 1];

    let instantaneous_throughput = (history.len() >= 2)
        .then(|| rate(&history[history.len() - 2], last))
        .flatten();

    let window_start = &history[history.len().saturating_sub(window)];
    let average_throughput = rate(window_start, last);

    let eta_seconds = average_throughput
        .filter(|throughput| *throughput > 0.0)
        .map(|throughput| last.progress.remaining() as f64 / throughput);
    let estimated_completion = eta_seconds
        .and_then(|seconds| chrono::Duration::try_milliseconds((seconds * 1000.0) as i64))
        .map(|delta| last.at + delta);

    ProgressSummary {
        task_id: task_id.to_string(),
        progress: last.progress.clone(),
        samples: history.len(),
        first_update: first.at,
        last_update: last.at,
        instantaneous_throughput,
        average_throughput,
        eta_seconds,
        estimated_completion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn throughput_and_eta_from_samples() {
        let monitor = ProgressMonitor::new(10, 3);
        let start = Utc::now();
        monitor.record("t", ProgressData::new(0, 100, ""), start);
        monitor.record("t", ProgressData::new(10, 100, ""), start + Duration::seconds(10));
        let summary = monitor.record("t", ProgressData::new(40, 100, ""), start + Duration::seconds(20));

        assert_eq!(summary.instantaneous_throughput, Some(3.0));
        assert_eq!(summary.average_throughput, Some(2.0));
        assert_eq!(summary.eta_seconds, Some(30.0));
        assert_eq!(summary.samples, 3);
    }

    #[test]
    fn eta_is_omitted_without_throughput() {
        let monitor = ProgressMonitor::default();
        let start = Utc::now();
        monitor.record("t", ProgressData::new(5, 10, ""), start);
        let summary = monitor.record("t", ProgressData::new(5, 10, ""), start + Duration::seconds(5));
        assert_eq!(summary.average_throughput, Some(0.0));
        assert!(summary.eta_seconds.is_none());
        assert!(summary.estimated_completion.is_none());

        let single = ProgressMonitor::default();
        assert!(single.update("u", 1, 10, "").eta_seconds.is_none());
    }

    #[test]
    fn history_is_bounded() {
        let monitor = ProgressMonitor::new(3, 2);
        let start = Utc::now();
        for i in 0..10 {
            monitor.record("t", ProgressData::new(i, 10, ""), start + Duration::seconds(i as i64));
        }
        let history = monitor.history("t");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].progress.current, 7);
        assert!(monitor.forget("t"));
        assert!(monitor.summary("t").is_none());
    }
}
