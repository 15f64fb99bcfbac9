//! Execution Timeline
//!
//! Records when each node starts and how it ends, for the end-of-run
//! Gantt chart and per-node durations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    /// Completed with placeholder outputs
    Placeholder,
    Failed,
    /// Outputs were already up to date
    UpToDate,
}

impl EventType {
    fn closes(&self) -> bool {
        !matches!(self, EventType::Started)
    }

    fn bar_char(&self) -> char {
        match self {
            EventType::Failed => 'x',
            EventType::Placeholder => '~',
            _ => '#',
        }
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub node: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Timeline of one run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, node: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            node: node.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of nodes that ended with the given event type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events.iter().filter(|e| e.event_type == event_type).count()
    }

    /// (start, end, outcome) in milliseconds since the run started.
    fn spans(&self) -> Vec<(String, u128, u128, EventType)> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.closes() {
                if let Some(start) = starts.remove(event.node.as_str()) {
                    spans.push((event.node.clone(), start, at, event.event_type));
                }
            } else {
                starts.insert(event.node.as_str(), at);
            }
        }

        spans.sort_by_key(|(_, start, _, _)| *start);
        spans
    }

    /// Node durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(node, start, end, _)| (node, end - start))
            .collect()
    }

    /// ASCII Gantt chart scaled to 50 columns. Failed nodes are drawn
    /// with `x`, placeholder nodes with `~`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }
        let scale = 50.0 / total_time as f64;

        for (node, start, end, outcome) in self.spans() {
            if end <= start {
                continue;
            }
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.extend(std::iter::repeat(outcome.bar_char()).take(width));

            output.push_str(&format!(
                "{:32} |{}| ({} ms)\n",
                truncate(&node, 32),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("coverage[sample=S1]", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("coverage[sample=S1]", EventType::Completed);

        let durations = timeline.get_durations();
        assert!(durations["coverage[sample=S1]"] >= 50);
    }

    #[test]
    fn test_only_started_has_no_duration() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("kraken2[sample=S1]", EventType::Started);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_count_outcomes() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a", EventType::UpToDate);
        timeline.add_event("b", EventType::Started);
        timeline.add_event("b", EventType::Failed);
        timeline.add_event("c", EventType::Started);
        timeline.add_event("c", EventType::Placeholder);

        assert_eq!(timeline.count(EventType::UpToDate), 1);
        assert_eq!(timeline.count(EventType::Failed), 1);
        assert_eq!(timeline.count(EventType::Placeholder), 1);
        assert_eq!(timeline.count(EventType::Completed), 0);
    }

    #[test]
    fn test_gantt_chart_marks_outcomes() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event("viral_mapping[sample=S1]", EventType::Started);
        thread::sleep(Duration::from_millis(40));
        timeline.add_event("viral_mapping[sample=S1]", EventType::Completed);

        timeline.add_event("kraken2[sample=S2]", EventType::Started);
        thread::sleep(Duration::from_millis(40));
        timeline.add_event("kraken2[sample=S2]", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("viral_mapping[sample=S1]"));
        let failed_line = chart
            .lines()
            .find(|l| l.starts_with("kraken2[sample=S2]"))
            .unwrap();
        let bar = failed_line.split('|').nth(1).unwrap();
        assert!(bar.contains('x'));
        assert!(!bar.contains('#'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
