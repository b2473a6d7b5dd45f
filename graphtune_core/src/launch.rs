//! External trainer invocation.
//!
//! Assembles the `python3 -m verl.trainer.main key=value ...` argv from a
//! [`LaunchConfig`], spawns the trainer with piped output, and propagates its
//! exit code.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::LaunchConfig;
use crate::errors::{CoreError, CoreResult};
use crate::jobs::{JobStatus, LaunchEvent, LaunchLifecycle};

/// Module invoked on the trainer side.
pub const TRAINER_MODULE: &str = "verl.trainer.main";

const DEFAULT_PYTHON: &str = "python3";
const LOG_RING_CAPACITY: usize = 200;

/// An assembled trainer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerCommand {
    /// Interpreter name or path (resolved against PATH at spawn time)
    pub program: String,
    /// `-m <module>` followed by `key=value` override tokens
    pub args: Vec<String>,
}

impl TrainerCommand {
    /// Assemble the trainer argv from a launch config.
    ///
    /// Tokens are emitted in config field declaration order, so the argv is
    /// deterministic for a given config. The reward kwargs are rendered as a
    /// single compact JSON literal.
    pub fn from_config(cfg: &LaunchConfig) -> CoreResult<Self> {
        let kwargs = serde_json::to_string(&cfg.worker.reward.reward_function_kwargs)?;
        let program = cfg
            .python
            .clone()
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string());

        let args = vec![
            "-m".to_string(),
            TRAINER_MODULE.to_string(),
            format!("config={}", cfg.config.display()),
            format!("data.train_files={}", cfg.data.train_files.display()),
            format!("data.val_files={}", cfg.data.val_files.display()),
            format!("data.format_prompt={}", cfg.data.format_prompt.display()),
            format!(
                "data.mini_rollout_batch_size={}",
                cfg.data.mini_rollout_batch_size
            ),
            format!("worker.actor.model_path={}", cfg.worker.actor.model_path),
            format!(
                "worker.actor.clip_ratio_low={}",
                cfg.worker.actor.clip_ratio_low
            ),
            format!(
                "worker.actor.clip_ratio_high={}",
                cfg.worker.actor.clip_ratio_high
            ),
            format!(
                "worker.reward.reward_function={}",
                cfg.worker.reward.reward_function
            ),
            format!("worker.reward.reward_function_kwargs={}", kwargs),
            format!("algorithm.disable_kl={}", cfg.algorithm.disable_kl),
            format!(
                "algorithm.online_filtering={}",
                cfg.algorithm.online_filtering
            ),
            format!("trainer.experiment_name={}", cfg.trainer.experiment_name),
            format!("trainer.n_gpus_per_node={}", cfg.trainer.n_gpus_per_node),
        ];

        Ok(Self { program, args })
    }

    /// Append raw override tokens after the config-derived ones.
    ///
    /// The trainer applies overrides left to right, so appended tokens win.
    pub fn with_extra_overrides(mut self, extra: &[String]) -> Self {
        self.args.extend(extra.iter().cloned());
        self
    }

    /// Shell-style rendering for dry runs and logging.
    pub fn rendered(&self) -> String {
        let mut tokens = Vec::with_capacity(self.args.len() + 1);
        tokens.push(shell_quote(&self.program));
        tokens.extend(self.args.iter().map(|a| shell_quote(a)));
        tokens.join(" ")
    }
}

fn shell_quote(token: &str) -> String {
    if token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '{' | '}' | '$'))
    {
        format!("'{}'", token.replace('\'', "'\\''"))
    } else {
        token.to_string()
    }
}

/// Resolve the interpreter to an executable path.
///
/// An explicit path in the config wins; a bare name goes through PATH lookup.
fn resolve_program(program: &str) -> CoreResult<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(CoreError::config(format!(
            "python interpreter not found: {}",
            program
        )));
    }
    which::which(program)
        .map_err(|_| CoreError::config(format!("'{}' not found on PATH", program)))
}

/// A spawned trainer with piped output.
///
/// Output lines are forwarded to tracing and retained in a bounded ring for
/// failure reports.
#[derive(Debug)]
pub struct TrainerProcess {
    pub child: Child,
    pub logs: Arc<Mutex<VecDeque<String>>>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl TrainerProcess {
    /// Snapshot of the most recent output lines.
    pub fn recent_logs(&self) -> Vec<String> {
        self.logs.lock().iter().cloned().collect()
    }

    /// Wait for the trainer to exit and return its exit status.
    pub async fn wait(&mut self) -> CoreResult<std::process::ExitStatus> {
        let status = self.child.wait().await?;
        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        Ok(status)
    }
}

/// Spawn the trainer with `PYTHONUNBUFFERED=1` and piped stdout/stderr.
pub async fn spawn_trainer(
    command: &TrainerCommand,
    experiment: &str,
) -> CoreResult<TrainerProcess> {
    let program = resolve_program(&command.program)?;
    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&command.args)
        .env("PYTHONUNBUFFERED", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| CoreError::launch(experiment, &format!("spawn failed: {}", e), None))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let logs = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)));
    let mut stdout_task = None;
    let mut stderr_task = None;
    if let Some(out) = stdout {
        let logs = logs.clone();
        stdout_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "trainer", "{}", line);
                push_log(&logs, &line);
            }
        }));
    }
    if let Some(err) = stderr {
        let logs = logs.clone();
        stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "trainer", "{}", line);
                push_log(&logs, &line);
            }
        }));
    }

    Ok(TrainerProcess {
        child,
        logs,
        stdout_task,
        stderr_task,
    })
}

fn push_log(logs: &Arc<Mutex<VecDeque<String>>>, line: &str) {
    let mut guard = logs.lock();
    guard.push_back(line.to_string());
    if guard.len() > LOG_RING_CAPACITY {
        guard.pop_front();
    }
}

/// Result of one trainer launch.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Child exit code; `128 + signal` on unix signal death
    pub exit_code: i32,
    pub status: JobStatus,
    pub events: Vec<LaunchEvent>,
}

/// Launch the trainer and wait for it to exit.
///
/// Returns the child's exit code and the recorded lifecycle; signal death
/// maps to `128 + signal` on unix. Spawn failures and exits without a
/// recoverable code are errors.
pub async fn launch(command: &TrainerCommand, experiment: &str) -> CoreResult<LaunchOutcome> {
    let mut lifecycle = LaunchLifecycle::new(experiment);

    let mut proc = match spawn_trainer(command, experiment).await {
        Ok(proc) => proc,
        Err(err) => {
            let _ = lifecycle.fail(Some(&err.to_string()), None);
            return Err(err);
        }
    };

    lifecycle.start(Some(json!({ "command": command.rendered() })))?;
    info!(experiment, "trainer launched: {}", command.rendered());

    let status = proc.wait().await?;
    let code = exit_code(status, experiment)?;

    if code == 0 {
        lifecycle.complete(Some(json!({ "exit_code": code })))?;
        info!(experiment, "trainer exited cleanly");
    } else {
        lifecycle.fail(Some("trainer exited with non-zero status"), Some(code))?;
        warn!(experiment, exit_code = code, "trainer exited with failure");
    }

    Ok(LaunchOutcome {
        exit_code: code,
        status: lifecycle.status(),
        events: lifecycle.events().to_vec(),
    })
}

fn exit_code(status: std::process::ExitStatus, experiment: &str) -> CoreResult<i32> {
    if let Some(code) = status.code() {
        return Ok(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Ok(128 + signal);
        }
    }
    Err(CoreError::launch(
        experiment,
        "trainer terminated without an exit code",
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_toml;

    fn sample_config() -> LaunchConfig {
        let value = parse_toml(crate::config::SAMPLE_TOML).unwrap();
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_argv_shape() {
        let cmd = TrainerCommand::from_config(&sample_config()).unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args[0], "-m");
        assert_eq!(cmd.args[1], TRAINER_MODULE);
        assert!(cmd.args.len() > 2);
        for token in &cmd.args[2..] {
            let (key, value) = token.split_once('=').expect("token must be key=value");
            assert!(!key.is_empty());
            assert!(!value.is_empty());
        }
    }

    #[test]
    fn test_argv_deterministic_order() {
        let cfg = sample_config();
        let first = TrainerCommand::from_config(&cfg).unwrap();
        let second = TrainerCommand::from_config(&cfg).unwrap();
        assert_eq!(first, second);

        assert_eq!(cmd_key(&first.args[2]), "config");
        assert_eq!(cmd_key(&first.args[3]), "data.train_files");
        assert_eq!(cmd_key(first.args.last().unwrap()), "trainer.n_gpus_per_node");
    }

    fn cmd_key(token: &str) -> &str {
        token.split_once('=').unwrap().0
    }

    #[test]
    fn test_reward_kwargs_token_is_json() {
        let cmd = TrainerCommand::from_config(&sample_config()).unwrap();
        let token = cmd
            .args
            .iter()
            .find(|t| t.starts_with("worker.reward.reward_function_kwargs="))
            .unwrap();
        let raw = token.split_once('=').unwrap().1;
        let parsed: serde_json::Value = serde_json::from_str(raw).unwrap();
        let obj = parsed.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        for key in [
            "max_response_length",
            "overlong_buffer_length",
            "overlong_penalty_factor",
            "format_weight",
        ] {
            assert!(obj.contains_key(key), "missing kwargs key {}", key);
        }
    }

    #[test]
    fn test_extra_overrides_appended_last() {
        let cmd = TrainerCommand::from_config(&sample_config())
            .unwrap()
            .with_extra_overrides(&["trainer.n_gpus_per_node=2".to_string()]);
        assert_eq!(cmd.args.last().unwrap(), "trainer.n_gpus_per_node=2");
    }

    #[test]
    fn test_python_override() {
        let mut cfg = sample_config();
        cfg.python = Some("/opt/conda/bin/python".to_string());
        let cmd = TrainerCommand::from_config(&cfg).unwrap();
        assert_eq!(cmd.program, "/opt/conda/bin/python");
    }

    #[test]
    fn test_rendered_quotes_json_token() {
        let cmd = TrainerCommand::from_config(&sample_config()).unwrap();
        let rendered = cmd.rendered();
        assert!(rendered.starts_with("python3 -m verl.trainer.main"));
        assert!(rendered.contains("'worker.reward.reward_function_kwargs="));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_error() {
        let command = TrainerCommand {
            program: "graphtune-no-such-python".to_string(),
            args: vec!["-m".to_string(), TRAINER_MODULE.to_string()],
        };
        let err = launch(&command, "missing_interpreter").await.unwrap_err();
        assert!(format!("{}", err).contains("not found"));
    }

    #[tokio::test]
    async fn test_exit_code_propagation() {
        let command = TrainerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 7".to_string()],
        };
        let outcome = launch(&command, "exit_code_test").await.unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0].event_type, "launch.started");
        assert_eq!(outcome.events[1].event_type, "launch.failed");
    }

    #[tokio::test]
    async fn test_clean_exit_completes_lifecycle() {
        let command = TrainerCommand {
            program: "true".to_string(),
            args: Vec::new(),
        };
        let outcome = launch(&command, "clean_exit_test").await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.events.last().unwrap().event_type, "launch.completed");
    }

    #[tokio::test]
    async fn test_output_captured_in_ring() {
        let command = TrainerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo step 1; echo step 2 >&2".to_string()],
        };
        let mut proc = spawn_trainer(&command, "ring_test").await.unwrap();
        let status = proc.wait().await.unwrap();
        assert!(status.success());
        let logs = proc.recent_logs();
        assert!(logs.iter().any(|l| l == "step 1"));
        assert!(logs.iter().any(|l| l == "step 2"));
    }
}
