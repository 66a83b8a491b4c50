use std::collections::BTreeMap;

use crate::ring::RingBuffer;
use crate::types::{ActivityRecord, LogEntry, LogEventKind, LogFilter, LogSummary};

/// Raw ingestion requests, read back newest first.
#[derive(Debug, Clone)]
pub struct ActivityJournal {
    entries: RingBuffer<ActivityRecord>,
}

impl ActivityJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RingBuffer::new(capacity),
        }
    }

    /// Append one request, evicting the oldest once full.
    pub fn record(&mut self, activity: ActivityRecord) {
        self.entries.push(activity);
    }

    /// Up to `limit` requests, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityRecord> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// One bounded history per known log event name, read back oldest first.
#[derive(Debug, Clone)]
pub struct LogJournal {
    entries: BTreeMap<LogEventKind, RingBuffer<LogEntry>>,
    capacity: usize,
}

impl LogJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LogEventKind::ALL
                .into_iter()
                .map(|kind| (kind, RingBuffer::new(capacity)))
                .collect(),
            capacity,
        }
    }

    /// Append to the event's own ring; each event name is capped separately.
    pub fn append(&mut self, event: LogEventKind, entry: LogEntry) {
        let capacity = self.capacity;
        self.entries
            .entry(event)
            .or_insert_with(|| RingBuffer::new(capacity))
            .push(entry);
    }

    /// Entries per event name, oldest first. An unknown `event` filter falls
    /// back to all names, and a `limit` of zero means no limit.
    pub fn entries(&self, filter: &LogFilter) -> BTreeMap<String, Vec<LogEntry>> {
        let selected = filter.event.as_deref().and_then(LogEventKind::from_name);

        self.entries
            .iter()
            .filter(|(kind, _)| selected.map_or(true, |wanted| wanted == **kind))
            .map(|(kind, ring)| {
                let matching: Vec<&LogEntry> = ring
                    .iter()
                    .filter(|entry| {
                        filter.from.map_or(true, |from| entry.timestamp >= from)
                            && filter.to.map_or(true, |to| entry.timestamp <= to)
                    })
                    .collect();
                let skip = filter
                    .limit
                    .filter(|limit| *limit > 0)
                    .map_or(0, |limit| matching.len().saturating_sub(limit));
                let entries = matching.into_iter().skip(skip).cloned().collect();
                (kind.as_str().to_string(), entries)
            })
            .collect()
    }

    /// Count and newest entry per event name.
    pub fn summary(&self) -> BTreeMap<String, LogSummary> {
        self.entries
            .iter()
            .map(|(kind, ring)| {
                (
                    kind.as_str().to_string(),
                    LogSummary {
                        count: ring.len(),
                        latest: ring.newest().cloned(),
                    },
                )
            })
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<LogEntry>> {
        self.entries
            .iter()
            .map(|(kind, ring)| (kind.as_str().to_string(), ring.to_vec()))
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::types::{ActivityRequest, Attributes};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0)
            .single()
            .expect("valid datetime")
            + Duration::seconds(seconds)
    }

    fn entry(seconds: i64, body: &str) -> LogEntry {
        LogEntry {
            timestamp: at(seconds),
            attributes: Attributes::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn activity_journal_reads_newest_first_and_caps() {
        let mut journal = ActivityJournal::new(100);
        for seconds in 0..105 {
            journal.record(ActivityRecord {
                timestamp: at(seconds),
                request: ActivityRequest::default(),
            });
        }

        assert_eq!(journal.len(), 100);
        let recent = journal.recent(3);
        let stamps: Vec<_> = recent.iter().map(|a| a.timestamp).collect();
        assert_eq!(stamps, vec![at(104), at(103), at(102)]);
        assert_eq!(journal.recent(500).last().map(|a| a.timestamp), Some(at(5)));
    }

    #[test]
    fn log_journal_evicts_per_event_name() {
        let mut journal = LogJournal::new(2);
        journal.append(LogEventKind::UserPrompt, entry(0, "a"));
        journal.append(LogEventKind::UserPrompt, entry(1, "b"));
        journal.append(LogEventKind::UserPrompt, entry(2, "c"));
        journal.append(LogEventKind::ApiError, entry(3, "boom"));

        let all = journal.entries(&LogFilter::default());
        let prompts: Vec<_> = all["claude_code.user_prompt"]
            .iter()
            .map(|e| e.body.as_str())
            .collect();
        assert_eq!(prompts, vec!["b", "c"]);
        assert_eq!(all["claude_code.api_error"].len(), 1);
        assert!(all["claude_code.tool_result"].is_empty());
    }

    #[test]
    fn log_filter_applies_event_range_and_limit() {
        let mut journal = LogJournal::new(10);
        for seconds in 0..6 {
            journal.append(LogEventKind::ToolResult, entry(seconds, &seconds.to_string()));
        }
        journal.append(LogEventKind::ApiRequest, entry(2, "other"));

        let filtered = journal.entries(&LogFilter {
            event: Some("claude_code.tool_result".to_string()),
            from: Some(at(1)),
            to: Some(at(4)),
            limit: Some(2),
        });

        assert_eq!(filtered.len(), 1);
        let bodies: Vec<_> = filtered["claude_code.tool_result"]
            .iter()
            .map(|e| e.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["3", "4"]);
    }

    #[test]
    fn zero_limit_returns_every_entry() {
        let mut journal = LogJournal::new(10);
        for seconds in 0..4 {
            journal.append(LogEventKind::UserPrompt, entry(seconds, &seconds.to_string()));
        }

        let filtered = journal.entries(&LogFilter {
            event: Some("claude_code.user_prompt".to_string()),
            limit: Some(0),
            ..LogFilter::default()
        });

        assert_eq!(filtered["claude_code.user_prompt"].len(), 4);
    }

    #[test]
    fn summary_reports_count_and_latest() {
        let mut journal = LogJournal::new(10);
        journal.append(LogEventKind::ToolDecision, entry(1, "first"));
        journal.append(LogEventKind::ToolDecision, entry(2, "second"));

        let summary = journal.summary();
        let decisions = &summary["claude_code.tool_decision"];
        assert_eq!(decisions.count, 2);
        assert_eq!(decisions.latest.as_ref().map(|e| e.body.as_str()), Some("second"));
        assert_eq!(summary["claude_code.user_prompt"].count, 0);
    }
}
