use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{JobStatus, Recorder};
use crate::error::{Error, Result};

/// The job payload submitted by the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub job_name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() {
            return Err(Error::BadRequest("job_name must not be empty".to_string()));
        }
        if self.commands.is_empty() {
            return Err(Error::BadRequest(
                "commands must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs the job under `sh -c`, streaming merged stdout/stderr into the
/// job-log history. Cancellation kills the child; the exit is recorded as
/// done, failed or stopped.
pub async fn execute(
    spec: JobSpec,
    code_path: Option<PathBuf>,
    recorder: Recorder,
    cancel: CancellationToken,
) -> JobStatus {
    info!(job = %spec.job_name, "job starting");
    recorder.job_state(JobStatus::Running, "");

    let script = spec.commands.join("\n");
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    for entry in &spec.env {
        match entry.split_once('=') {
            Some((key, value)) => {
                command.env(key, value);
            }
            None => warn!(%entry, "skipping malformed env entry"),
        }
    }
    if let Some(path) = &code_path {
        command.env("DOCKHAND_CODE_PATH", path);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            recorder.job_state(JobStatus::Failed, format!("spawn failed: {e}"));
            return JobStatus::Failed;
        }
    };

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_output(stdout, recorder.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_output(stderr, recorder.clone()));
    }

    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            cancelled = true;
            debug!(job = %spec.job_name, "cancellation requested, killing job");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill job process");
            }
            child.wait().await
        }
    };

    // Pipes close once the child is gone; drain everything before the final
    // state so log order matches reality.
    for handle in readers {
        let _ = handle.await;
    }

    let final_state = match status {
        Err(e) => {
            recorder.job_state(JobStatus::Failed, format!("wait failed: {e}"));
            JobStatus::Failed
        }
        Ok(_) if cancelled => {
            recorder.job_state(JobStatus::Stopped, "job cancelled");
            JobStatus::Stopped
        }
        Ok(status) if status.success() => {
            recorder.job_state(JobStatus::Done, "exit code 0");
            JobStatus::Done
        }
        Ok(status) => {
            let message = match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            };
            recorder.job_state(JobStatus::Failed, message);
            JobStatus::Failed
        }
    };
    info!(job = %spec.job_name, state = ?final_state, "job finished");
    final_state
}

fn forward_output<R>(reader: R, recorder: Recorder) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => recorder.job_log(buf[..n].to_vec()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::runner::history::{History, spawn_recorder};

    fn spec(commands: &[&str]) -> JobSpec {
        JobSpec {
            job_name: "test".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    async fn job_output(history: &Arc<Mutex<History>>) -> String {
        // Give the recorder a beat to drain.
        for _ in 0..100 {
            if !history.lock().await.pull(0).job_logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        history
            .lock()
            .await
            .pull(0)
            .job_logs
            .iter()
            .map(|e| e.data.clone())
            .collect()
    }

    #[test]
    fn empty_specs_are_rejected() {
        assert!(spec(&[]).validate().is_err());
        let mut nameless = spec(&["true"]);
        nameless.job_name = String::new();
        assert!(nameless.validate().is_err());
        assert!(spec(&["true"]).validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: serde_json::Result<JobSpec> = serde_json::from_str(
            r#"{"job_name": "j", "commands": ["true"], "surprise": true}"#,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn successful_job_streams_output_and_reports_done() {
        let history = Arc::new(Mutex::new(History::new()));
        let (recorder, _handle) = spawn_recorder(history.clone());

        let state = execute(
            spec(&["echo hello"]),
            None,
            recorder,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(state, JobStatus::Done);
        assert!(job_output(&history).await.contains("hello"));
    }

    #[tokio::test]
    async fn env_and_multiple_commands_reach_the_shell() {
        let history = Arc::new(Mutex::new(History::new()));
        let (recorder, _handle) = spawn_recorder(history.clone());

        let mut job = spec(&["echo \"$GREETING\"", "echo second"]);
        job.env = vec!["GREETING=hi there".to_string(), "malformed".to_string()];
        let state = execute(job, None, recorder, CancellationToken::new()).await;
        assert_eq!(state, JobStatus::Done);
        let output = job_output(&history).await;
        assert!(output.contains("hi there"));
        assert!(output.contains("second"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failed_with_code() {
        let history = Arc::new(Mutex::new(History::new()));
        let (recorder, _handle) = spawn_recorder(history.clone());

        let state = execute(spec(&["exit 3"]), None, recorder, CancellationToken::new()).await;
        assert_eq!(state, JobStatus::Failed);

        for _ in 0..100 {
            if history.lock().await.pull(0).job_states.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let states = history.lock().await.pull(0).job_states;
        let last = states.last().unwrap().clone();
        assert_eq!(last.state, JobStatus::Failed);
        assert_eq!(last.message, "exit code 3");
    }

    #[tokio::test]
    async fn cancellation_kills_the_job() {
        let history = Arc::new(Mutex::new(History::new()));
        let (recorder, _handle) = spawn_recorder(history.clone());

        let cancel = CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.cancel();
        });

        let state = execute(spec(&["sleep 30"]), None, recorder, cancel).await;
        assert_eq!(state, JobStatus::Stopped);
    }
}
