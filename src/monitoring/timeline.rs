//! Execution Timeline
//!
//! Tracks step start/end times for an execution, for reports, Gantt
//! charts, and for observing which steps overlapped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Step was dispatched to its executor
    Started,
    /// Step completed successfully
    Completed,
    /// Step condition evaluated false
    Skipped,
    /// An attempt failed and another one is scheduled
    Retrying,
    /// Step failed after exhausting its retries
    Failed,
    /// Step was interrupted by cancellation
    Cancelled,
}

impl EventType {
    fn is_end(self) -> bool {
        !matches!(self, Self::Started | Self::Retrying)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// Name of the step
    pub step: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Attempt number the event belongs to (1-based)
    #[serde(default)]
    pub attempt: u32,
}

/// Tracks the execution timeline of a workflow run.
///
/// Records when each step starts, completes, fails, or is skipped,
/// enabling generation of Gantt charts and timing reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
}

impl ExecutionTimeline {
    /// Creates an empty timeline.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step: impl Into<String>, event_type: EventType, attempt: u32) {
        self.events.push(TimelineEvent {
            step: step.into(),
            event_type,
            timestamp: Utc::now(),
            attempt,
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the events recorded for one step.
    pub fn events_for<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a TimelineEvent> + 'a {
        self.events.iter().filter(move |e| e.step == step)
    }

    /// Returns the first start and the last terminal event time of a step.
    pub fn step_window(&self, step: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self
            .events_for(step)
            .find(|e| e.event_type == EventType::Started)?
            .timestamp;
        let end = self
            .events_for(step)
            .filter(|e| e.event_type.is_end())
            .last()?
            .timestamp;
        Some((start, end))
    }

    /// Returns true if the two steps were running at the same time.
    pub fn overlaps(&self, a: &str, b: &str) -> bool {
        match (self.step_window(a), self.step_window(b)) {
            (Some((a_start, a_end)), Some((b_start, b_end))) => a_start < b_end && b_start < a_end,
            _ => false,
        }
    }

    /// Returns the span between the first and the last event.
    pub fn elapsed(&self) -> chrono::Duration {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => chrono::Duration::zero(),
        }
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let Some(origin) = self.events.first().map(|e| e.timestamp) else {
            return output;
        };

        let total_time = self.elapsed().num_milliseconds().max(1);

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut step_times: HashMap<&str, (i64, i64)> = HashMap::new();
        for event in &self.events {
            let elapsed = (event.timestamp - origin).num_milliseconds();
            match event.event_type {
                EventType::Started => {
                    step_times.entry(event.step.as_str()).or_insert((elapsed, elapsed));
                }
                EventType::Retrying => {}
                _ => {
                    let times = step_times.entry(event.step.as_str()).or_insert((elapsed, elapsed));
                    times.1 = elapsed;
                }
            }
        }

        // Sort by start time, then name for stable output
        let mut sorted_steps: Vec<_> = step_times.into_iter().collect();
        sorted_steps.sort_by(|(a_name, a), (b_name, b)| a.0.cmp(&b.0).then(a_name.cmp(b_name)));

        for (step, (start, end)) in sorted_steps {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64 * scale) as usize).max(1);

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:<20} |{:<51}| {}ms\n",
                truncate_name(step, 20),
                bar,
                end - start
            ));
        }

        output
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if no events were recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Truncates a step name to fit the chart column.
fn truncate_name(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        name.to_string()
    } else {
        let kept: String = name.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
