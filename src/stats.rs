use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyRecord {
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolUsage {
    pub succeeded: u32,
    pub failed: u32,
}

impl ToolUsage {
    pub fn total(&self) -> u32 {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    records: Vec<LatencyRecord>,
    tools: BTreeMap<String, ToolUsage>,
}

/// Response latency and tool usage for the session.
///
/// Cloning yields another handle to the same store, so the conversation loop
/// and the tool-calling client can share it.
#[derive(Debug, Clone, Default)]
pub struct StatsTracker {
    inner: Arc<Mutex<StatsInner>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        // A panic while holding the lock cannot leave the records half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one completed model response.
    pub fn record(&self, duration: Duration) {
        self.lock().records.push(LatencyRecord {
            completed_at: Utc::now(),
            duration,
        });
    }

    /// Register the tools the provider advertised, so they show up in the
    /// report even before they are used.
    pub fn set_available_tools<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.lock();
        for name in names {
            inner.tools.entry(name.into()).or_default();
        }
    }

    pub fn record_tool_call(&self, name: &str, success: bool) {
        let mut inner = self.lock();
        let usage = inner.tools.entry(name.to_string()).or_default();
        if success {
            usage.succeeded += 1;
        } else {
            usage.failed += 1;
        }
    }

    pub fn response_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn summarize(&self) -> StatsReport {
        let inner = self.lock();
        let tools = inner
            .tools
            .iter()
            .map(|(name, usage)| (name.clone(), *usage))
            .collect();

        let latency = if inner.records.is_empty() {
            None
        } else {
            let durations = inner.records.iter().map(|r| r.duration);
            let total: Duration = durations.clone().sum();
            Some(LatencySummary {
                average: mean(total, inner.records.len()),
                min: durations.clone().min().unwrap_or_default(),
                max: durations.max().unwrap_or_default(),
                first_completed: inner.records.iter().map(|r| r.completed_at).min(),
                last_completed: inner.records.iter().map(|r| r.completed_at).max(),
            })
        };

        StatsReport {
            count: inner.records.len(),
            latency,
            tools,
        }
    }
}

fn mean(total: Duration, count: usize) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / count as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummary {
    pub average: Duration,
    pub min: Duration,
    pub max: Duration,
    pub first_completed: Option<DateTime<Utc>>,
    pub last_completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub count: usize,
    /// `None` when no response has completed yet.
    pub latency: Option<LatencySummary>,
    pub tools: Vec<(String, ToolUsage)>,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session Statistics ===")?;
        if self.tools.is_empty() {
            writeln!(f, "Tools: none available")?;
        } else {
            writeln!(f, "Tools ({}):", self.tools.len())?;
            for (name, usage) in &self.tools {
                writeln!(
                    f,
                    "  - {} ({} calls, {} failed)",
                    name,
                    usage.total(),
                    usage.failed
                )?;
            }
        }

        writeln!(f, "Responses: {}", self.count)?;
        if let Some(latency) = &self.latency {
            writeln!(f, "Average: {:.3}s", latency.average.as_secs_f64())?;
            writeln!(f, "Min: {:.3}s", latency.min.as_secs_f64())?;
            writeln!(f, "Max: {:.3}s", latency.max.as_secs_f64())?;
            if let (Some(first), Some(last)) = (latency.first_completed, latency.last_completed) {
                writeln!(f, "First response: {}", first.format("%Y-%m-%d %H:%M:%S"))?;
                writeln!(f, "Last response: {}", last.format("%Y-%m-%d %H:%M:%S"))?;
            }
        }
        Ok(())
    }
}
