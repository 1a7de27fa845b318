use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{info, warn};

use crate::agent::{AgentKind, AgentMessage, Phase, looks_unavailable, parse_agent_line};
use crate::config::AgentConfig;

/// Polled by spawn-waits and long sleeps; true aborts early.
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
/// Receives every parsed message as it streams in.
pub type OnMessage = Arc<dyn Fn(AgentMessage) + Send + Sync>;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_GRACE: Duration = Duration::from_secs(2);
const TAIL_CHARS: usize = 2_000;

/// What one agent invocation produced, after any fallback attempts.
#[derive(Debug)]
pub struct ExecutionResult {
    pub success: bool,
    /// Raw stdout of every attempt, concatenated.
    pub output: String,
    pub messages: Vec<AgentMessage>,
    pub error: Option<String>,
    pub stderr_tail: String,
    /// Last attempt's output/error, for failure analysis after a fallback
    /// sequence muddied the concatenated log.
    pub refined_output: Option<String>,
    pub refined_error: Option<String>,
    pub agent_used: AgentKind,
}

#[derive(Debug)]
struct Attempt {
    success: bool,
    output: String,
    messages: Vec<AgentMessage>,
    stderr: String,
    error: Option<String>,
    stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Success,
    RateLimited,
    Unavailable,
    Failed,
    Stopped,
}

/// Runs one implementation, verification, or fix invocation: spawn the
/// agent binary, stream its stdout into normalized messages, classify the
/// exit, and cycle through fallback agents on rate limits or missing
/// binaries.
pub struct AgentExecutor {
    config: AgentConfig,
    project_dir: PathBuf,
}

impl AgentExecutor {
    pub fn new(project_dir: impl Into<PathBuf>, config: AgentConfig) -> Self {
        Self {
            config,
            project_dir: project_dir.into(),
        }
    }

    /// Implementation phase: full tool set, runs in the worktree.
    pub async fn execute_session(
        &self,
        prompt: &str,
        worktree: &Path,
        stop: StopPredicate,
        on_message: OnMessage,
    ) -> ExecutionResult {
        self.execute(prompt, Phase::Implementation, worktree, stop, on_message)
            .await
    }

    /// Verification phase: restricted tool set, runs in the project root
    /// against the merged base branch.
    pub async fn execute_verification(
        &self,
        prompt: &str,
        stop: StopPredicate,
        on_message: OnMessage,
    ) -> ExecutionResult {
        let root = self.project_dir.clone();
        self.execute(prompt, Phase::Verification, &root, stop, on_message)
            .await
    }

    /// Fix phase: full tool set, back in the worktree, prompt carries the
    /// failing verification tail.
    pub async fn execute_fix(
        &self,
        prompt: &str,
        worktree: &Path,
        stop: StopPredicate,
        on_message: OnMessage,
    ) -> ExecutionResult {
        self.execute(prompt, Phase::Fix, worktree, stop, on_message)
            .await
    }

    /// The fallback loop. Order is the preferred agent followed by the
    /// configured fallbacks; unavailable agents are skipped, rate-limited
    /// agents are skipped until every agent is marked, then the marks are
    /// cleared after the configured wait.
    async fn execute(
        &self,
        prompt: &str,
        phase: Phase,
        cwd: &Path,
        stop: StopPredicate,
        on_message: OnMessage,
    ) -> ExecutionResult {
        let order = self.agent_order();
        let preferred = order[0];
        let mut rate_limited: HashSet<AgentKind> = HashSet::new();
        let mut unavailable: HashSet<AgentKind> = HashSet::new();
        let mut current = preferred;
        let mut current_prompt = prompt.to_string();

        let mut all_output = String::new();
        let mut all_messages: Vec<AgentMessage> = Vec::new();
        let mut attempts = 0u32;
        // One full wait-and-reset cycle is allowed; persistent limits are
        // the scheduler's problem (it requeues the feature).
        let mut waited = false;

        loop {
            attempts += 1;
            info!(agent = %current, ?phase, attempt = attempts, "spawning agent");
            let attempt = self
                .run_once(current, &current_prompt, phase, cwd, &stop, &on_message)
                .await;

            all_output.push_str(&attempt.output);
            all_messages.extend(attempt.messages.iter().cloned());
            let outcome = classify_attempt(&attempt, current);

            match outcome {
                AttemptOutcome::Success => {
                    return self.finish(true, all_output, all_messages, None, &attempt, attempts, current);
                }
                AttemptOutcome::Stopped => {
                    return self.finish(
                        false,
                        all_output,
                        all_messages,
                        Some("stopped by orchestrator".into()),
                        &attempt,
                        attempts,
                        current,
                    );
                }
                AttemptOutcome::Failed => {
                    let error = attempt
                        .error
                        .clone()
                        .unwrap_or_else(|| "agent exited with failure".into());
                    return self.finish(false, all_output, all_messages, Some(error), &attempt, attempts, current);
                }
                AttemptOutcome::Unavailable => {
                    warn!(agent = %current, "agent unavailable");
                    unavailable.insert(current);
                    let next = order
                        .iter()
                        .copied()
                        .find(|a| !unavailable.contains(a) && !rate_limited.contains(a));
                    match next {
                        Some(next) => {
                            all_messages.push(AgentMessage::system_note(format!(
                                "{current} unavailable, switching to {next}"
                            )));
                            current = next;
                            // The failed agent never saw the prompt; reuse it.
                            current_prompt = prompt.to_string();
                        }
                        None if !rate_limited.is_empty() && !waited => {
                            waited = true;
                            all_messages.push(AgentMessage::system_note(format!(
                                "all agents unavailable or rate-limited, waiting to retry {preferred}"
                            )));
                            if !self.wait_rate_limit(&stop).await {
                                return self.finish(
                                    false,
                                    all_output,
                                    all_messages,
                                    Some("stopped by orchestrator".into()),
                                    &attempt,
                                    attempts,
                                    current,
                                );
                            }
                            rate_limited.clear();
                            current = preferred;
                            current_prompt = prompt.to_string();
                        }
                        None => {
                            return self.finish(
                                false,
                                all_output,
                                all_messages,
                                Some(format!("no agent available (tried {attempts})")),
                                &attempt,
                                attempts,
                                current,
                            );
                        }
                    }
                }
                AttemptOutcome::RateLimited => {
                    warn!(agent = %current, "agent rate-limited");
                    rate_limited.insert(current);
                    let next = order
                        .iter()
                        .copied()
                        .find(|a| !rate_limited.contains(a) && !unavailable.contains(a));
                    match next {
                        Some(next) => {
                            all_messages.push(AgentMessage::system_note(format!(
                                "{current} rate-limited, switching to {next}"
                            )));
                            // The next agent starts cold; hand it what the
                            // rate-limited one had already done.
                            current_prompt = self.augment_prompt(prompt, &attempt, cwd);
                            current = next;
                        }
                        None if !waited => {
                            waited = true;
                            all_messages.push(AgentMessage::system_note(
                                "every agent rate-limited, waiting before retry",
                            ));
                            if !self.wait_rate_limit(&stop).await {
                                return self.finish(
                                    false,
                                    all_output,
                                    all_messages,
                                    Some("stopped by orchestrator".into()),
                                    &attempt,
                                    attempts,
                                    current,
                                );
                            }
                            rate_limited.clear();
                            current = preferred;
                            current_prompt = prompt.to_string();
                        }
                        None => {
                            return self.finish(
                                false,
                                all_output,
                                all_messages,
                                Some("agent rate limit persisted after waiting".into()),
                                &attempt,
                                attempts,
                                current,
                            );
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        success: bool,
        output: String,
        messages: Vec<AgentMessage>,
        error: Option<String>,
        last: &Attempt,
        attempts: u32,
        agent_used: AgentKind,
    ) -> ExecutionResult {
        let refined = attempts > 1;
        ExecutionResult {
            success,
            stderr_tail: tail(&last.stderr, TAIL_CHARS),
            refined_output: refined.then(|| last.output.clone()),
            refined_error: refined.then(|| last.error.clone().unwrap_or_default()),
            output,
            messages,
            error,
            agent_used,
        }
    }

    /// Preferred agent first, then the configured fallbacks filtered to
    /// valid names, without repeating the preferred.
    fn agent_order(&self) -> Vec<AgentKind> {
        let preferred =
            AgentKind::parse(&self.config.preferred).unwrap_or(AgentKind::Claude);
        let mut order = vec![preferred];
        for name in &self.config.fallback {
            if let Some(kind) = AgentKind::parse(name) {
                if !order.contains(&kind) {
                    order.push(kind);
                }
            }
        }
        order
    }

    async fn run_once(
        &self,
        agent: AgentKind,
        prompt: &str,
        phase: Phase,
        cwd: &Path,
        stop: &StopPredicate,
        on_message: &OnMessage,
    ) -> Attempt {
        let (program, args) = agent.build_command(prompt, phase, &self.config);
        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .current_dir(cwd)
            .env("PATH", self.augmented_path(cwd))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Attempt {
                    success: false,
                    output: String::new(),
                    messages: Vec::new(),
                    stderr: String::new(),
                    error: Some(format!("failed to spawn {program}: {e}")),
                    stopped: false,
                };
            }
        };

        let stdout_task = child.stdout.take().map(|stdout| {
            let on_message = on_message.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut output = String::new();
                let mut messages = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    output.push_str(&line);
                    output.push('\n');
                    for message in parse_agent_line(&line, agent) {
                        on_message(message.clone());
                        messages.push(message);
                    }
                }
                (output, messages)
            })
        });
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut stopped = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = tokio::time::sleep(STOP_POLL_INTERVAL) => {
                    if !stopped && stop() {
                        stopped = true;
                        terminate(&mut child).await;
                    }
                }
            }
        };

        let (output, messages) = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => (String::new(), Vec::new()),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let (success, error) = match status {
            Ok(status) if status.success() && !stopped => (true, None),
            Ok(status) => (
                false,
                Some(format!("agent exited with {status}")),
            ),
            Err(e) => (false, Some(format!("failed to wait on agent: {e}"))),
        };

        Attempt {
            success,
            output,
            messages,
            stderr,
            error,
            stopped,
        }
    }

    /// PATH with the bin-like subdirectories of each configured dependency
    /// directory appended, worktree first, then project root.
    fn augmented_path(&self, cwd: &Path) -> String {
        let mut path = std::env::var("PATH").unwrap_or_default();
        for dep in &self.config.dependency_dirs {
            for root in [cwd, self.project_dir.as_path()] {
                for bin in ["bin", ".bin"] {
                    let candidate = root.join(dep).join(bin);
                    if candidate.is_dir() {
                        path.push(':');
                        path.push_str(&candidate.to_string_lossy());
                    }
                }
            }
        }
        path
    }

    /// Prompt handed to the next agent after a rate-limit switch: the
    /// original task plus what the previous agent managed to do.
    fn augment_prompt(&self, original: &str, attempt: &Attempt, cwd: &Path) -> String {
        let mut sections = vec![original.to_string()];
        sections.push("## Context from a previous attempt (agent switched mid-task)".into());
        if !attempt.output.is_empty() {
            sections.push(format!(
                "Recent output:\n{}",
                tail(&attempt.output, TAIL_CHARS)
            ));
        }
        if let Some(error) = &attempt.error {
            sections.push(format!("Last error:\n{}", tail(error, 500)));
        }
        let snapshot = repo_snapshot(cwd);
        if !snapshot.is_empty() {
            sections.push(format!("Repository state:\n{snapshot}"));
        }
        sections.join("\n\n")
    }

    /// Sleep the configured rate-limit delay, polling the stop predicate.
    /// Returns false if stopped.
    async fn wait_rate_limit(&self, stop: &StopPredicate) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.rate_limit_wait_ms);
        while tokio::time::Instant::now() < deadline {
            if stop() {
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(Duration::from_millis(
                self.config.rate_limit_wait_ms.max(1),
            )))
            .await;
        }
        !stop()
    }
}

/// Graceful terminate: SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
    }
}

fn classify_attempt(attempt: &Attempt, agent: AgentKind) -> AttemptOutcome {
    if attempt.success {
        return AttemptOutcome::Success;
    }
    if attempt.stopped {
        return AttemptOutcome::Stopped;
    }
    let combined = format!(
        "{}\n{}\n{}",
        attempt.output,
        attempt.stderr,
        attempt.error.as_deref().unwrap_or("")
    );
    if agent.looks_like_rate_limit(&combined) {
        AttemptOutcome::RateLimited
    } else if looks_unavailable(&combined) {
        AttemptOutcome::Unavailable
    } else {
        AttemptOutcome::Failed
    }
}

fn tail(text: &str, chars: usize) -> String {
    if text.chars().count() <= chars {
        return text.to_string();
    }
    text.chars()
        .skip(text.chars().count() - chars)
        .collect()
}

fn repo_snapshot(cwd: &Path) -> String {
    let run = |args: &[&str]| -> String {
        std::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default()
    };
    let status = run(&["status", "--porcelain"]);
    let diff = run(&["diff", "--stat"]);
    let last = run(&["log", "-1", "--oneline"]);
    let mut parts = Vec::new();
    if !status.is_empty() {
        parts.push(format!("status:\n{status}"));
    }
    if !diff.is_empty() {
        parts.push(format!("diff:\n{diff}"));
    }
    if !last.is_empty() {
        parts.push(format!("last commit: {last}"));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MessageKind;
    use crate::config::AgentCommandOverride;
    use std::sync::Mutex;

    fn never_stop() -> StopPredicate {
        Arc::new(|| false)
    }

    fn sink() -> OnMessage {
        Arc::new(|_| {})
    }

    fn script_override(script: &str) -> AgentCommandOverride {
        AgentCommandOverride {
            command: Some("bash".into()),
            args: Some(vec!["-c".into(), script.into(), "--".into(), "{{PROMPT}}".into()]),
            verification_args: None,
        }
    }

    fn config_with(overrides: &[(&str, AgentCommandOverride)]) -> AgentConfig {
        let mut config = AgentConfig {
            rate_limit_wait_ms: 50,
            ..AgentConfig::default()
        };
        for (name, over) in overrides {
            config.commands.insert(name.to_string(), over.clone());
        }
        config
    }

    #[tokio::test]
    async fn successful_run_parses_stream() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[(
            "claude",
            script_override(
                r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'; echo '{"type":"result","subtype":"success","result":"done"}'"#,
            ),
        )]);
        let executor = AgentExecutor::new(dir.path(), config);
        let result = executor
            .execute_session("task", dir.path(), never_stop(), sink())
            .await;

        assert!(result.success);
        assert_eq!(result.agent_used, AgentKind::Claude);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].kind, MessageKind::Assistant);
        assert_eq!(result.messages[1].kind, MessageKind::Result);
        assert!(result.output.contains("working"));
        assert!(result.refined_output.is_none());
    }

    #[tokio::test]
    async fn streamed_messages_reach_callback_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[(
            "claude",
            script_override("echo one; echo two; echo three"),
        )]);
        let executor = AgentExecutor::new(dir.path(), config);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let on_message: OnMessage = Arc::new(move |m: AgentMessage| {
            seen_clone
                .lock()
                .unwrap()
                .push(m.content.unwrap_or_default());
        });

        let result = executor
            .execute_session("task", dir.path(), never_stop(), on_message)
            .await;
        assert!(result.success);
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn rate_limit_falls_back_to_next_agent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[
            (
                "claude",
                script_override("echo 'HTTP 429 Too Many Requests' >&2; exit 1"),
            ),
            ("codex", script_override("echo recovered; exit 0")),
        ]);
        let executor = AgentExecutor::new(dir.path(), config);
        let result = executor
            .execute_session("task", dir.path(), never_stop(), sink())
            .await;

        assert!(result.success);
        assert_eq!(result.agent_used, AgentKind::Codex);
        assert!(result.output.contains("recovered"));
        // The switch is recorded as a system message
        assert!(result.messages.iter().any(|m| {
            m.kind == MessageKind::System
                && m.content.as_deref().is_some_and(|c| c.contains("rate-limited"))
        }));
        // Fallback happened, so refined fields carry the last attempt
        assert_eq!(result.refined_output.as_deref(), Some("recovered\n"));
    }

    #[tokio::test]
    async fn rate_limited_agent_gets_augmented_prompt_successor() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[
            (
                "claude",
                script_override("echo 'partial work log'; echo 'rate limit exceeded' >&2; exit 1"),
            ),
            // The fallback prints the prompt it received
            (
                "codex",
                AgentCommandOverride {
                    command: Some("bash".into()),
                    args: Some(vec!["-c".into(), "echo \"$1\"".into(), "--".into(), "{{PROMPT}}".into()]),
                    verification_args: None,
                },
            ),
        ]);
        let executor = AgentExecutor::new(dir.path(), config);
        let result = executor
            .execute_session("original task", dir.path(), never_stop(), sink())
            .await;

        assert!(result.success);
        // The successor's prompt embeds the original and the previous tail
        assert!(result.output.contains("original task"));
        assert!(result.output.contains("partial work log"));
    }

    #[tokio::test]
    async fn unavailable_falls_back_with_original_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(&[(
            "codex",
            AgentCommandOverride {
                command: Some("bash".into()),
                args: Some(vec!["-c".into(), "echo \"$1\"".into(), "--".into(), "{{PROMPT}}".into()]),
                verification_args: None,
            },
        )]);
        config.commands.insert(
            "claude".into(),
            AgentCommandOverride {
                command: Some("/nonexistent/agent-binary".into()),
                args: Some(vec!["{{PROMPT}}".into()]),
                verification_args: None,
            },
        );
        let executor = AgentExecutor::new(dir.path(), config);
        let result = executor
            .execute_session("plain task", dir.path(), never_stop(), sink())
            .await;

        assert!(result.success);
        assert_eq!(result.agent_used, AgentKind::Codex);
        // No augmentation on unavailability switches
        assert!(result.output.contains("plain task"));
        assert!(!result.output.contains("previous attempt"));
    }

    #[tokio::test]
    async fn plain_failure_surfaces_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[
            (
                "claude",
                script_override("echo 'TypeError: undefined is not a function' >&2; exit 1"),
            ),
            ("codex", script_override("echo should-not-run")),
        ]);
        let executor = AgentExecutor::new(dir.path(), config);
        let result = executor
            .execute_session("task", dir.path(), never_stop(), sink())
            .await;

        assert!(!result.success);
        assert_eq!(result.agent_used, AgentKind::Claude);
        assert!(result.error.is_some());
        assert!(!result.output.contains("should-not-run"));
        assert!(result.stderr_tail.contains("TypeError"));
    }

    #[tokio::test]
    async fn all_rate_limited_waits_then_retries_preferred() {
        let dir = tempfile::tempdir().unwrap();
        // Every agent reports 429 the first time; a marker file flips the
        // preferred agent to success on its second run.
        let marker = dir.path().join("second-run");
        let script = format!(
            "if [ -f {m} ]; then echo ok; exit 0; else touch {m}; echo 'rate limit' >&2; exit 1; fi",
            m = marker.display()
        );
        let mut config = config_with(&[("claude", script_override(&script))]);
        config.fallback = vec![];
        let executor = AgentExecutor::new(dir.path(), config);

        let result = executor
            .execute_session("task", dir.path(), never_stop(), sink())
            .await;
        assert!(result.success);
        assert_eq!(result.agent_used, AgentKind::Claude);
    }

    #[tokio::test]
    async fn stop_predicate_terminates_agent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[("claude", script_override("sleep 30"))]);
        let executor = AgentExecutor::new(dir.path(), config);

        let start = std::time::Instant::now();
        let result = executor
            .execute_session("task", dir.path(), Arc::new(|| true), sink())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("stopped by orchestrator"));
        // Far sooner than the 30s sleep: one poll tick plus the kill grace
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn agent_order_respects_preference_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            preferred: "codex".into(),
            fallback: vec!["bogus".into(), "codex".into(), "claude".into()],
            ..AgentConfig::default()
        };
        let executor = AgentExecutor::new(dir.path(), config);
        assert_eq!(
            executor.agent_order(),
            vec![AgentKind::Codex, AgentKind::Claude]
        );
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 5), "ab");
    }
}
