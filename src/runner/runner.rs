use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{History, JobStatus, PullResponse, Recorder};
use super::job::{self, JobSpec};
use crate::config::RunnerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    WaitSubmit,
    WaitCode,
    WaitRun,
    ServeLogs,
    WaitLogsFinished,
}

/// Completion flag with signal-exactly-once semantics: the first `set_once`
/// wakes every waiter, duplicates are a no-op.
pub struct Signal {
    set: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            set: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Returns whether this call was the first.
    pub fn set_once(&self) -> bool {
        if self.set.swap(true, Ordering::AcqRel) {
            false
        } else {
            self.notify.notify_waiters();
            true
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a signal landing in between
            // cannot be missed.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// In-container agent: accepts exactly one job per process instance, runs it
/// and serves its state/output back over the pull and WebSocket protocols.
/// Any call outside its valid protocol state returns a conflict, never
/// silently queues or overwrites state.
pub struct Runner {
    pub config: RunnerConfig,
    status: Mutex<RunnerStatus>,
    job: Mutex<Option<JobSpec>>,
    pub history: Arc<Mutex<History>>,
    recorder: Recorder,
    job_cancel: CancellationToken,
    /// Set once the supervisor decides the process is winding down; pollers
    /// drain against it.
    pub shutdown: CancellationToken,
    submitted: Signal,
    finished: Signal,
    pull_drained: Signal,
    pub(crate) ws_drained: Signal,
    exec: Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    pub fn new(config: RunnerConfig, history: Arc<Mutex<History>>, recorder: Recorder) -> Self {
        Runner {
            config,
            status: Mutex::new(RunnerStatus::WaitSubmit),
            job: Mutex::new(None),
            history,
            recorder,
            job_cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            submitted: Signal::new(),
            finished: Signal::new(),
            pull_drained: Signal::new(),
            ws_drained: Signal::new(),
            exec: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> RunnerStatus {
        *self.status.lock().await
    }

    /// Accepts the job spec. Valid only while waiting for a submission.
    pub async fn submit(&self, spec: JobSpec) -> Result<()> {
        spec.validate()?;
        let mut status = self.status.lock().await;
        if *status != RunnerStatus::WaitSubmit {
            return Err(Error::Request(format!(
                "submit rejected in state {:?}",
                *status
            )));
        }
        info!(job = %spec.job_name, "job submitted");
        *self.job.lock().await = Some(spec);
        *status = RunnerStatus::WaitCode;
        drop(status);

        self.recorder.job_state(JobStatus::Created, "");
        self.submitted.set_once();
        Ok(())
    }

    /// Stores the uploaded payload at the configured code path. Valid only
    /// between submit and run.
    pub async fn upload_code(&self, body: &[u8]) -> Result<()> {
        let mut status = self.status.lock().await;
        if *status != RunnerStatus::WaitCode {
            return Err(Error::Request(format!(
                "upload_code rejected in state {:?}",
                *status
            )));
        }
        if body.len() > self.config.max_code_size {
            return Err(Error::BadRequest(format!(
                "code payload of {} bytes exceeds the {} byte limit",
                body.len(),
                self.config.max_code_size
            )));
        }
        if let Some(parent) = self.config.code_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config.code_path, body).await?;
        *status = RunnerStatus::WaitRun;
        info!(bytes = body.len(), path = %self.config.code_path.display(), "job code stored");
        Ok(())
    }

    /// Starts job execution as an owned detached unit of work and moves to
    /// serving logs immediately, without waiting for completion.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut status = self.status.lock().await;
        if *status != RunnerStatus::WaitRun {
            return Err(Error::Request(format!(
                "run rejected in state {:?}",
                *status
            )));
        }
        let spec = self
            .job
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Internal("job spec missing after submit".to_string()))?;
        *status = RunnerStatus::ServeLogs;
        drop(status);

        let runner = Arc::clone(self);
        let cancel = self.job_cancel.child_token();
        let handle = tokio::spawn(async move {
            let code_path = runner
                .config
                .code_path
                .exists()
                .then(|| runner.config.code_path.clone());
            job::execute(spec, code_path, runner.recorder.clone(), cancel).await;
            runner.finished.set_once();
        });
        *self.exec.lock().await = Some(handle);
        Ok(())
    }

    /// Requests job cancellation and moves to draining.
    pub async fn stop(&self) -> Result<()> {
        let mut status = self.status.lock().await;
        if *status == RunnerStatus::WaitLogsFinished {
            return Err(Error::Request("job is already stopping".to_string()));
        }
        *status = RunnerStatus::WaitLogsFinished;
        drop(status);

        self.job_cancel.cancel();
        // Nothing ever ran: completion will not arrive from the executor.
        if self.exec.lock().await.is_none() {
            self.finished.set_once();
        }
        info!("job stop requested");
        Ok(())
    }

    /// Cursor read over the whole history. Observed in the draining state it
    /// marks (once) that the control plane has caught up.
    pub async fn pull(&self, after: u64) -> PullResponse {
        let response = self.history.lock().await.pull(after);
        if *self.status.lock().await == RunnerStatus::WaitLogsFinished
            && self.pull_drained.set_once()
        {
            debug!("pull history drained");
        }
        response
    }

    /// Top-level lifecycle: bounded submit wait, bounded completion wait,
    /// then bounded drain waits so every buffered byte reaches the control
    /// plane before the process is allowed to exit.
    pub async fn supervise(self: &Arc<Self>, external: CancellationToken) -> Result<()> {
        info!("waiting for job submission");
        tokio::select! {
            _ = self.submitted.wait() => {}
            _ = external.cancelled() => {
                self.shutdown.cancel();
                return Ok(());
            }
            _ = tokio::time::sleep(self.config.submit_timeout) => {
                self.shutdown.cancel();
                return Err(Error::Request(
                    "no job submitted within the submit timeout".to_string(),
                ));
            }
        }

        tokio::select! {
            _ = self.finished.wait() => {}
            _ = external.cancelled() => {
                info!("external cancellation, stopping job");
                self.stop_and_await_finish().await;
            }
            _ = tokio::time::sleep(self.config.logs_timeout) => {
                warn!("job exceeded the logs timeout, stopping");
                self.stop_and_await_finish().await;
            }
        }

        *self.status.lock().await = RunnerStatus::WaitLogsFinished;
        self.shutdown.cancel();

        if timeout(self.config.drain_timeout, self.pull_drained.wait())
            .await
            .is_err()
        {
            warn!("control plane never drained the pull history");
        }
        if timeout(self.config.drain_timeout, self.ws_drained.wait())
            .await
            .is_err()
        {
            warn!("websocket stream never drained");
        }

        if let Some(handle) = self.exec.lock().await.take() {
            let _ = handle.await;
        }
        info!("runner supervisor done");
        Ok(())
    }

    async fn stop_and_await_finish(&self) {
        if let Err(e) = self.stop().await {
            debug!(error = %e, "stop during shutdown");
        }
        if timeout(self.config.drain_timeout, self.finished.wait())
            .await
            .is_err()
        {
            warn!("job did not finish within the drain timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::runner::history::spawn_recorder;

    fn test_runner(dir: &tempfile::TempDir) -> Arc<Runner> {
        let config = RunnerConfig {
            listen: "127.0.0.1:0".to_string(),
            code_path: dir.path().join("code"),
            max_code_size: 1024,
            submit_timeout: Duration::from_millis(100),
            logs_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_millis(100),
            ws_poll_interval: Duration::from_millis(10),
        };
        let history = Arc::new(Mutex::new(History::new()));
        let (recorder, _handle) = spawn_recorder(history.clone());
        Arc::new(Runner::new(config, history, recorder))
    }

    fn job() -> JobSpec {
        JobSpec {
            job_name: "j".to_string(),
            commands: vec!["echo run".to_string()],
            env: Vec::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn protocol_steps_succeed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);

        // Out-of-order calls conflict.
        assert!(matches!(
            runner.upload_code(b"early").await.unwrap_err(),
            Error::Request(_)
        ));
        assert!(matches!(runner.run().await.unwrap_err(), Error::Request(_)));

        runner.submit(job()).await.unwrap();
        assert_eq!(runner.status().await, RunnerStatus::WaitCode);
        assert!(matches!(
            runner.submit(job()).await.unwrap_err(),
            Error::Request(_)
        ));

        runner.upload_code(b"payload").await.unwrap();
        assert_eq!(runner.status().await, RunnerStatus::WaitRun);
        assert!(matches!(
            runner.upload_code(b"again").await.unwrap_err(),
            Error::Request(_)
        ));
        assert_eq!(std::fs::read(dir.path().join("code")).unwrap(), b"payload");

        runner.run().await.unwrap();
        assert_eq!(runner.status().await, RunnerStatus::ServeLogs);
        assert!(matches!(runner.run().await.unwrap_err(), Error::Request(_)));

        runner.finished.wait().await;
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);
        runner.submit(job()).await.unwrap();
        let err = runner.upload_code(&[0u8; 2048]).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        // Still waiting for a valid payload.
        assert_eq!(runner.status().await, RunnerStatus::WaitCode);
    }

    #[tokio::test]
    async fn stop_before_run_unblocks_completion() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);
        runner.submit(job()).await.unwrap();
        runner.stop().await.unwrap();
        assert_eq!(runner.status().await, RunnerStatus::WaitLogsFinished);
        assert!(runner.finished.is_set());
        assert!(matches!(runner.stop().await.unwrap_err(), Error::Request(_)));
    }

    #[tokio::test]
    async fn pull_in_drain_state_marks_drained_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);
        runner.submit(job()).await.unwrap();

        runner.pull(0).await;
        assert!(!runner.pull_drained.is_set());

        runner.stop().await.unwrap();
        runner.pull(0).await;
        assert!(runner.pull_drained.is_set());
    }

    #[tokio::test]
    async fn supervisor_times_out_without_submission() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);
        let err = runner
            .supervise(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Request(_)));
        assert!(runner.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn supervisor_runs_job_to_completion_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);

        let supervisor = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.supervise(CancellationToken::new()).await })
        };

        runner.submit(job()).await.unwrap();
        runner.upload_code(b"code").await.unwrap();
        runner.run().await.unwrap();

        runner.finished.wait().await;
        // Drain like the control plane would.
        runner.shutdown.cancelled().await;
        runner.pull(0).await;
        runner.ws_drained.set_once();

        supervisor.await.unwrap().unwrap();
        assert_eq!(last_job_state(&runner).await, JobStatus::Done);
    }

    async fn last_job_state(runner: &Arc<Runner>) -> JobStatus {
        // The recorder drains asynchronously; poll for the terminal event.
        for _ in 0..100 {
            let states = runner.history.lock().await.pull(0).job_states;
            if let Some(last) = states.last() {
                if last.state != JobStatus::Created && last.state != JobStatus::Running {
                    return last.state;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no terminal job state recorded");
    }

    #[tokio::test]
    async fn external_cancellation_stops_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let runner = test_runner(&dir);
        let external = CancellationToken::new();

        let supervisor = {
            let runner = Arc::clone(&runner);
            let external = external.clone();
            tokio::spawn(async move { runner.supervise(external).await })
        };

        runner.submit(job()).await.unwrap();
        runner.upload_code(b"code").await.unwrap();
        let mut long_job = job();
        long_job.commands = vec!["sleep 30".to_string()];
        *runner.job.lock().await = Some(long_job);
        runner.run().await.unwrap();

        external.cancel();
        supervisor.await.unwrap().unwrap();
        assert!(runner.finished.is_set());
        assert_eq!(last_job_state(&runner).await, JobStatus::Stopped);
    }
}
