use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Done,
    Failed,
    Stopped,
}

#[derive(Debug)]
pub enum HistoryEvent {
    JobState(JobStatus, String),
    JobLog(Vec<u8>),
    RunnerLog(Vec<u8>),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStateEvent {
    pub timestamp: u64,
    pub state: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LogChunk {
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Wire form of a log chunk: bytes go out lossy-decoded so the pull payload
/// stays plain JSON.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub data: String,
}

impl From<&LogChunk> for LogEntry {
    fn from(chunk: &LogChunk) -> Self {
        LogEntry {
            timestamp: chunk.timestamp,
            data: String::from_utf8_lossy(&chunk.data).into_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    pub job_states: Vec<JobStateEvent>,
    pub job_logs: Vec<LogEntry>,
    pub runner_logs: Vec<LogEntry>,
    pub last_updated: u64,
}

/// Append-only event history. Every entry is stamped from one strictly
/// increasing counter so cursor reads stay unambiguous even when wall-clock
/// time is identical across entries. Entries are never reordered, mutated or
/// evicted during a run.
pub struct History {
    last: u64,
    job_states: Vec<JobStateEvent>,
    job_logs: Vec<LogChunk>,
    runner_logs: Vec<LogChunk>,
}

impl History {
    pub fn new() -> Self {
        History {
            last: 0,
            job_states: Vec::new(),
            job_logs: Vec::new(),
            runner_logs: Vec::new(),
        }
    }

    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let timestamp = now.max(self.last + 1);
        self.last = timestamp;
        timestamp
    }

    pub fn append(&mut self, event: HistoryEvent) {
        let timestamp = self.next_timestamp();
        match event {
            HistoryEvent::JobState(state, message) => self.job_states.push(JobStateEvent {
                timestamp,
                state,
                message,
            }),
            HistoryEvent::JobLog(data) => self.job_logs.push(LogChunk { timestamp, data }),
            HistoryEvent::RunnerLog(data) => self.runner_logs.push(LogChunk { timestamp, data }),
        }
    }

    /// Everything after the caller's cursor, in append order.
    pub fn pull(&self, after: u64) -> PullResponse {
        PullResponse {
            job_states: self
                .job_states
                .iter()
                .filter(|e| e.timestamp > after)
                .cloned()
                .collect(),
            job_logs: self
                .job_logs
                .iter()
                .filter(|c| c.timestamp > after)
                .map(LogEntry::from)
                .collect(),
            runner_logs: self
                .runner_logs
                .iter()
                .filter(|c| c.timestamp > after)
                .map(LogEntry::from)
                .collect(),
            last_updated: self.last,
        }
    }

    /// Raw job-log chunks starting at `index`, for the WebSocket pusher.
    pub fn job_log_chunks_from(&self, index: usize) -> Vec<Vec<u8>> {
        self.job_logs[index.min(self.job_logs.len())..]
            .iter()
            .map(|c| c.data.clone())
            .collect()
    }

    pub fn last_updated(&self) -> u64 {
        self.last
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle to the single writer path. State changes, job output and
/// runner output all funnel through the same channel so timestamp assignment
/// and append order stay consistent; nobody writes the buffers directly.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<HistoryEvent>,
}

impl Recorder {
    pub fn job_state(&self, state: JobStatus, message: impl Into<String>) {
        let _ = self.tx.send(HistoryEvent::JobState(state, message.into()));
    }

    pub fn job_log(&self, data: Vec<u8>) {
        let _ = self.tx.send(HistoryEvent::JobLog(data));
    }

    pub fn runner_log(&self, data: Vec<u8>) {
        let _ = self.tx.send(HistoryEvent::RunnerLog(data));
    }
}

pub fn spawn_recorder(history: Arc<Mutex<History>>) -> (Recorder, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            history.lock().await.append(event);
        }
    });
    (Recorder { tx }, handle)
}

/// Tees the runner's own formatted tracing output into the runner-log
/// buffer so diagnostics ride the same pull protocol as job output.
#[derive(Clone)]
pub struct HistoryWriter {
    recorder: Recorder,
}

impl HistoryWriter {
    pub fn new(recorder: Recorder) -> Self {
        HistoryWriter { recorder }
    }
}

impl std::io::Write for HistoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.recorder.runner_log(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for HistoryWriter {
    type Writer = HistoryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let mut history = History::new();
        for i in 0..100 {
            history.append(HistoryEvent::JobLog(vec![i]));
        }
        let response = history.pull(0);
        let stamps: Vec<u64> = response.job_logs.iter().map(|e| e.timestamp).collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn pull_cursor_never_repeats_and_never_skips() {
        let mut history = History::new();
        history.append(HistoryEvent::JobState(JobStatus::Running, String::new()));
        history.append(HistoryEvent::JobLog(b"one".to_vec()));

        let first = history.pull(0);
        assert_eq!(first.job_states.len(), 1);
        assert_eq!(first.job_logs.len(), 1);

        // Same cursor again: everything already seen comes back unchanged;
        // cursor at last_updated: nothing comes back.
        assert_eq!(history.pull(0).job_logs.len(), 1);
        let drained = history.pull(first.last_updated);
        assert!(drained.job_states.is_empty());
        assert!(drained.job_logs.is_empty());

        // A new event shows up exactly once past the old cursor.
        history.append(HistoryEvent::JobLog(b"two".to_vec()));
        let next = history.pull(first.last_updated);
        assert_eq!(next.job_logs.len(), 1);
        assert_eq!(next.job_logs[0].data, "two");
        assert!(next.last_updated > first.last_updated);
    }

    #[test]
    fn buffers_are_separate_but_share_the_clock() {
        let mut history = History::new();
        history.append(HistoryEvent::RunnerLog(b"boot".to_vec()));
        history.append(HistoryEvent::JobState(JobStatus::Running, String::new()));
        history.append(HistoryEvent::JobLog(b"out".to_vec()));

        let response = history.pull(0);
        assert!(response.runner_logs[0].timestamp < response.job_states[0].timestamp);
        assert!(response.job_states[0].timestamp < response.job_logs[0].timestamp);
    }

    #[test]
    fn ws_chunks_resume_from_index() {
        let mut history = History::new();
        history.append(HistoryEvent::JobLog(b"a".to_vec()));
        history.append(HistoryEvent::JobLog(b"b".to_vec()));
        assert_eq!(history.job_log_chunks_from(0).len(), 2);
        assert_eq!(history.job_log_chunks_from(1), vec![b"b".to_vec()]);
        assert!(history.job_log_chunks_from(2).is_empty());
        assert!(history.job_log_chunks_from(99).is_empty());
    }

    #[tokio::test]
    async fn recorder_funnels_producers_into_one_writer() {
        let history = Arc::new(Mutex::new(History::new()));
        let (recorder, handle) = spawn_recorder(history.clone());

        recorder.job_state(JobStatus::Running, "started");
        recorder.job_log(b"chunk".to_vec());
        recorder.runner_log(b"diag".to_vec());

        // The recorder drains asynchronously; poll until it has.
        for _ in 0..100 {
            if history.lock().await.last_updated() > 0
                && history.lock().await.pull(0).runner_logs.len() == 1
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let response = history.lock().await.pull(0);
        assert_eq!(response.job_states.len(), 1);
        assert_eq!(response.job_logs.len(), 1);
        assert_eq!(response.runner_logs.len(), 1);

        drop(recorder);
        let _ = handle.await;
    }
}
