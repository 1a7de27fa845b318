use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::agent::{AgentMessage, Phase};
use crate::config::{CriticalPattern, ProjectConfig, TrackDef, validate_tracks};
use crate::events::{Event, EventBus};
use crate::executor::{AgentExecutor, ExecutionResult, OnMessage, StopPredicate};
use crate::features::{FailureKind, Feature, FeatureError, FeatureStatus, FeatureStore};
use crate::lock::{FifoMutex, FileLock};
use crate::prompts::{self, PromptVars};
use crate::queues::{QueueItem, QueueManager};
use crate::sessions::{SessionError, SessionLog, SessionRecord, SessionStatus, SessionUpdate};
use crate::workspace::{WorkspaceError, WorkspaceManager};

const IDLE_POLL: Duration = Duration::from_millis(500);
const RESUME_POLL: Duration = Duration::from_millis(500);
const FAST_FAILURE_WINDOW: Duration = Duration::from_secs(10);
const FAST_FAILURE_PAUSE: Duration = Duration::from_secs(5);
const CRITICAL_BREAK_THRESHOLD: u32 = 2;
const CONTEXT_TAIL_CHARS: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Stopped,
    Setup,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackStatus {
    pub current_feature: Option<u64>,
    pub current_session: Option<String>,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeRequest {
    pub feature_id: u64,
    pub track: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: OrchestratorState,
    pub tracks: BTreeMap<String, TrackStatus>,
    pub resume: Option<ResumeRequest>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator is {0:?}, operation not allowed")]
    InvalidState(OrchestratorState),
    #[error("invalid track configuration: {0}")]
    InvalidTracks(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("config save failed: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("tracks are not configured")]
    NotConfigured,
}

/// How one agent failure should be treated, derived from the combined
/// output and error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAnalysis {
    pub reason: String,
    pub kind: AnalyzedKind,
    pub is_critical: bool,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzedKind {
    Environment,
    TestOnly,
    RateLimit,
    Implementation,
    Unknown,
}

impl AnalyzedKind {
    fn as_failure_kind(self) -> FailureKind {
        match self {
            Self::Environment => FailureKind::Environment,
            Self::TestOnly => FailureKind::TestOnly,
            Self::Implementation => FailureKind::Implementation,
            // Rate limits never reach the feature store
            Self::RateLimit | Self::Unknown => FailureKind::Unknown,
        }
    }
}

/// Classify a failed agent run. Order matters: configured critical patterns
/// win, then test-only signals, then rate limits, then a best-effort
/// error-line extraction.
pub fn analyze_failure(critical: &[CriticalPattern], combined: &str) -> FailureAnalysis {
    for pattern in critical {
        match regex::Regex::new(&pattern.pattern) {
            Ok(re) => {
                if re.is_match(combined) {
                    return FailureAnalysis {
                        reason: pattern.label.clone(),
                        kind: AnalyzedKind::Environment,
                        is_critical: true,
                        label: Some(pattern.label.clone()),
                    };
                }
            }
            Err(e) => warn!(pattern = %pattern.pattern, error = %e, "skipping invalid critical pattern"),
        }
    }

    let lower = combined.to_lowercase();
    let test_only = lower.contains("tests failed")
        || lower.contains("test failed")
        || lower.contains("assertion failed")
        || lower.contains("verification could not")
        || regex_match(r"expected .+ to (equal|be|contain|match)", combined);
    if test_only {
        return FailureAnalysis {
            reason: "tests or assertions failed".into(),
            kind: AnalyzedKind::TestOnly,
            is_critical: false,
            label: None,
        };
    }

    let rate_limited = lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("usage limit")
        || lower.contains("quota")
        || lower.contains("usage exceeded");
    if rate_limited {
        return FailureAnalysis {
            reason: "agent rate-limited".into(),
            kind: AnalyzedKind::RateLimit,
            is_critical: false,
            label: None,
        };
    }

    let error_line = combined
        .lines()
        .rev()
        .find(|line| {
            let l = line.to_lowercase();
            l.contains("error")
                || l.contains("fail")
                || l.contains("fatal")
                || l.contains("exception")
                || l.contains("cannot")
                || l.contains("unable")
        })
        .map(|line| truncate(line.trim(), 200));

    match error_line {
        Some(reason) => FailureAnalysis {
            reason,
            kind: AnalyzedKind::Implementation,
            is_critical: false,
            label: None,
        },
        None => FailureAnalysis {
            reason: "agent failed without a recognizable error".into(),
            kind: AnalyzedKind::Unknown,
            is_critical: false,
            label: None,
        },
    }
}

fn regex_match(pattern: &str, text: &str) -> bool {
    regex::Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

/// A verification transcript fails on an explicit verdict or any failed
/// step, even when the agent exits zero.
pub fn verification_failed(output: &str) -> bool {
    output.contains("VERDICT: FAIL") || regex_match(r"STEP \d+: FAIL", output)
}

/// Collect the failing lines for the fix prompt and the feature record.
fn failed_step_lines(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .filter(|l| l.contains("STEP") && l.contains("FAIL") || l.contains("VERDICT: FAIL"))
        .collect();
    if lines.is_empty() {
        "verification failed".into()
    } else {
        truncate(&lines.join("; "), 400)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

fn tail(text: &str, chars: usize) -> String {
    let count = text.chars().count();
    if count <= chars {
        text.to_string()
    } else {
        text.chars().skip(count - chars).collect()
    }
}

/// Drives the whole pipeline: one loop per track pulling features through
/// implement, merge, verify, and fix. Plain composition over the stores,
/// the workspace manager, and the executor; many orchestrators can coexist
/// in one process.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    project_dir: PathBuf,
    config: RwLock<ProjectConfig>,
    features: FeatureStore,
    sessions: SessionLog,
    workspace: WorkspaceManager,
    executor: AgentExecutor,
    queues: RwLock<Option<Arc<QueueManager>>>,
    bus: EventBus,
    state: Mutex<OrchestratorState>,
    resume_request: Mutex<Option<ResumeRequest>>,
    track_status: Mutex<BTreeMap<String, TrackStatus>>,
    verification_mutex: FifoMutex,
    stopping: AtomicBool,
    pending_tracks: Mutex<Option<Vec<TrackDef>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(project_dir: impl Into<PathBuf>, config: ProjectConfig) -> Self {
        let project_dir = project_dir.into();
        let features = FeatureStore::new(config.features_file(&project_dir));
        let sessions = SessionLog::new(project_dir.join(".autodev").join("sessions.json"));
        let workspace = WorkspaceManager::new(
            project_dir.clone(),
            &config.base_branch,
            config.workspace.clone(),
        );
        let executor = AgentExecutor::new(project_dir.clone(), config.agent.clone());
        Self {
            inner: Arc::new(Inner {
                project_dir,
                config: RwLock::new(config),
                features,
                sessions,
                workspace,
                executor,
                queues: RwLock::new(None),
                bus: EventBus::new(),
                state: Mutex::new(OrchestratorState::Stopped),
                resume_request: Mutex::new(None),
                track_status: Mutex::new(BTreeMap::new()),
                verification_mutex: FifoMutex::new(),
                stopping: AtomicBool::new(false),
                pending_tracks: Mutex::new(None),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn features(&self) -> &FeatureStore {
        &self.inner.features
    }

    pub fn sessions(&self) -> &SessionLog {
        &self.inner.sessions
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.current_state()
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.inner.snapshot()
    }

    /// Initialize the repository, load features, run the setup handshake if
    /// tracks were never configured, and launch one loop per track. Returns
    /// once the loops are running (or setup was cancelled by `stop`).
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        {
            let mut state = self.inner.lock_state();
            if *state != OrchestratorState::Stopped {
                return Err(OrchestratorError::InvalidState(*state));
            }
            *state = OrchestratorState::Setup;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);

        if let Err(e) = self.inner.workspace.init().await {
            self.inner.set_state(OrchestratorState::Stopped);
            return Err(e.into());
        }
        let features = match self.inner.features.load_features() {
            Ok(features) => features,
            Err(e) => {
                self.inner.set_state(OrchestratorState::Stopped);
                return Err(e.into());
            }
        };
        let categories: BTreeSet<String> =
            features.iter().map(|f| f.category.clone()).collect();

        let configured = self.inner.config.read().unwrap_or_else(|e| e.into_inner()).tracks_configured;
        let tracks = if configured {
            let config = self.inner.config.read().unwrap_or_else(|e| e.into_inner());
            let covered: BTreeSet<&String> = config
                .tracks
                .iter()
                .flat_map(|t| t.categories.iter())
                .collect();
            let uncovered: Vec<String> = categories
                .iter()
                .filter(|c| !covered.contains(c))
                .cloned()
                .collect();
            if !uncovered.is_empty() {
                info!(?uncovered, "categories without a track, routing to default");
                self.inner.bus.publish(Event::NewCategories {
                    categories: uncovered,
                });
            }
            config.tracks.clone()
        } else {
            info!("no track configuration, awaiting configure_tracks");
            self.inner.publish_status();
            self.inner.bus.publish(Event::NewCategories {
                categories: categories.iter().cloned().collect(),
            });
            match self.await_track_configuration().await {
                Some(tracks) => tracks,
                None => {
                    // stop() during setup
                    self.inner.set_state(OrchestratorState::Stopped);
                    self.inner.publish_status();
                    return Ok(());
                }
            }
        };

        let queues = Arc::new(QueueManager::new(tracks.clone()));
        queues.initialize_queues(&features);
        {
            let mut slot = self.inner.queues.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(queues.clone());
        }
        {
            let mut status = self.inner.lock_track_status();
            status.clear();
            for track in &tracks {
                status.insert(
                    track.name.clone(),
                    TrackStatus {
                        queued: queues.queued_count(&track.name),
                        ..TrackStatus::default()
                    },
                );
            }
        }
        self.inner.set_state(OrchestratorState::Running);
        self.inner.publish_status();

        let mut handles = self.inner.lock_handles();
        for track in &tracks {
            let inner = self.inner.clone();
            let name = track.name.clone();
            handles.push(tokio::spawn(async move {
                track_loop(inner, name).await;
            }));
        }
        info!(tracks = tracks.len(), "orchestrator running");
        Ok(())
    }

    async fn await_track_configuration(&self) -> Option<Vec<TrackDef>> {
        loop {
            if self.inner.stopping.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(tracks) = self
                .inner
                .pending_tracks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                return Some(tracks);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Answer the setup handshake. Only legal while the orchestrator is in
    /// setup; the accepted configuration is persisted.
    pub fn configure_tracks(&self, tracks: Vec<TrackDef>) -> Result<(), OrchestratorError> {
        let state = self.inner.current_state();
        if state != OrchestratorState::Setup {
            return Err(OrchestratorError::InvalidState(state));
        }
        validate_tracks(&tracks).map_err(OrchestratorError::InvalidTracks)?;

        {
            let mut config = self.inner.config.write().unwrap_or_else(|e| e.into_inner());
            config.tracks = tracks.clone();
            config.tracks_configured = true;
            config.save(&self.inner.project_dir)?;
        }
        *self
            .inner
            .pending_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tracks);
        Ok(())
    }

    /// Request a graceful stop. Running agents finish; loops exit between
    /// features.
    pub fn stop(&self) {
        let mut state = self.inner.lock_state();
        match *state {
            OrchestratorState::Running | OrchestratorState::Setup => {
                info!("stop requested");
                *state = OrchestratorState::Stopping;
            }
            _ => {}
        }
        drop(state);
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.publish_status();
    }

    /// Wait for every track loop to exit, then settle into stopped.
    pub async fn join(&self) {
        let handles: Vec<_> = self.inner.lock_handles().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "track loop panicked");
            }
        }
        self.inner.set_state(OrchestratorState::Stopped);
        self.inner.publish_status();
    }

    /// Operator action: reopen a failed feature and queue it ahead of main
    /// work, carrying a note and the tail of its previous session.
    pub fn retry_feature(&self, id: u64, note: &str) -> Result<(), OrchestratorError> {
        let (track, context, previous) = self.prepare_requeue(id, note)?;
        let queues = self.inner.queues_handle()?;
        queues.enqueue_retry(id, &track, &context, previous);
        self.inner.refresh_queue_counts(&queues);
        self.inner.publish_status();
        info!(feature = id, track, "feature queued for retry");
        Ok(())
    }

    /// Operator action: like retry, but the feature jumps every queue and
    /// all other tracks hold their dequeue until it completes.
    pub fn resume_feature(&self, id: u64, note: &str) -> Result<(), OrchestratorError> {
        let (track, context, previous) = self.prepare_requeue(id, note)?;
        let queues = self.inner.queues_handle()?;
        queues.enqueue_resume(id, &track, &context, previous);
        *self
            .inner
            .resume_request
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(ResumeRequest {
            feature_id: id,
            track: track.clone(),
            requested_at: Utc::now(),
        });
        self.inner.refresh_queue_counts(&queues);
        self.inner.publish_status();
        info!(feature = id, track, "feature queued for resume, other tracks held");
        Ok(())
    }

    fn prepare_requeue(
        &self,
        id: u64,
        note: &str,
    ) -> Result<(String, String, Option<String>), OrchestratorError> {
        let feature = self
            .inner
            .features
            .get_feature(id)?
            .ok_or(FeatureError::NotFound(id))?;

        let updated =
            self.inner
                .features
                .update_feature_status(id, FeatureStatus::Open, None, None, None)?;
        self.inner.bus.publish(Event::FeatureUpdated(updated));

        let previous = self.inner.sessions.get_latest_session_for_feature(id)?;
        let mut context = String::new();
        if !note.trim().is_empty() {
            context.push_str(note.trim());
        }
        if let Some(prev) = &previous {
            let prev_tail = if prev.messages.is_empty() {
                tail(&prev.output, CONTEXT_TAIL_CHARS)
            } else {
                let rendered: Vec<String> = prev
                    .messages
                    .iter()
                    .filter_map(|m| m.content.clone())
                    .collect();
                tail(&rendered.join("\n"), CONTEXT_TAIL_CHARS)
            };
            if !prev_tail.is_empty() {
                if !context.is_empty() {
                    context.push_str("\n\n");
                }
                context.push_str("Tail of the previous attempt:\n");
                context.push_str(&prev_tail);
            }
        }

        let queues = self.inner.queues_handle()?;
        let track = queues
            .track_for(&feature)
            .ok_or(OrchestratorError::NotConfigured)?
            .to_string();
        Ok((track, context, previous.map(|p| p.id)))
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_track_status(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TrackStatus>> {
        self.track_status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<tokio::task::JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_state(&self) -> OrchestratorState {
        *self.lock_state()
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.lock_state() = state;
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Merge/push failures and zero-commit runs corrupt the pipeline's
    /// assumptions; stop everything rather than spin.
    fn begin_stop(&self, why: &str) {
        error!(why, "initiating orchestrator stop");
        let mut state = self.lock_state();
        if *state == OrchestratorState::Running {
            *state = OrchestratorState::Stopping;
        }
        drop(state);
        self.stopping.store(true, Ordering::SeqCst);
        self.publish_status();
    }

    fn queues_handle(&self) -> Result<Arc<QueueManager>, OrchestratorError> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(OrchestratorError::NotConfigured)
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.current_state(),
            tracks: self.lock_track_status().clone(),
            resume: self
                .resume_request
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    fn publish_status(&self) {
        self.bus.publish(Event::OrchestratorStatus(self.snapshot()));
    }

    fn refresh_queue_counts(&self, queues: &QueueManager) {
        let mut status = self.lock_track_status();
        for (name, track_status) in status.iter_mut() {
            track_status.queued = queues.queued_count(name);
        }
    }

    fn update_track<F: FnOnce(&mut TrackStatus)>(&self, track: &str, f: F) {
        let mut status = self.lock_track_status();
        f(status.entry(track.to_string()).or_default());
        drop(status);
        self.publish_status();
    }

    fn resume_blocks(&self, track: &str) -> bool {
        self.resume_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|req| req.track != track)
    }

    fn clear_resume_if(&self, feature_id: u64) {
        let mut request = self
            .resume_request
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if request.as_ref().is_some_and(|r| r.feature_id == feature_id) {
            *request = None;
        }
    }

    fn stop_predicate(self: &Arc<Self>) -> StopPredicate {
        let inner = self.clone();
        Arc::new(move || inner.is_stopping())
    }

    /// Callback wired into the executor: every parsed message goes straight
    /// out on the bus tagged with its session.
    fn message_sink(self: &Arc<Self>, session_id: &str) -> OnMessage {
        let inner = self.clone();
        let session_id = session_id.to_string();
        Arc::new(move |message: AgentMessage| {
            inner.bus.publish(Event::AgentOutput {
                session_id: session_id.clone(),
                message,
            });
        })
    }

    fn mark_feature(
        &self,
        id: u64,
        status: FeatureStatus,
        reason: Option<String>,
        kind: Option<FailureKind>,
        progress: Option<String>,
    ) {
        match self
            .features
            .update_feature_status(id, status, reason, kind, progress)
        {
            Ok(updated) => self.bus.publish(Event::FeatureUpdated(updated)),
            Err(e) => warn!(feature = id, error = %e, "failed to update feature"),
        }
    }

    /// One line per terminal outcome, appended to the progress log under the
    /// shared file lock.
    fn append_progress(&self, feature: &Feature, line: &str) {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        let path = config.progress_file(&self.project_dir);
        drop(config);
        let _lock = match FileLock::acquire(&path) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "could not lock progress log");
                return;
            }
        };
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let entry = format!(
            "{existing}- {} feature {} ({}): {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            feature.id,
            feature.name,
            line
        );
        if let Err(e) = std::fs::write(&path, entry) {
            warn!(error = %e, "could not append to progress log");
        }
    }

    async fn sleep_with_stop(&self, total: Duration) {
        let deadline = tokio::time::Instant::now() + total;
        while tokio::time::Instant::now() < deadline {
            if self.is_stopping() {
                return;
            }
            tokio::time::sleep(IDLE_POLL.min(total)).await;
        }
    }
}

/// Outcome of one feature's trip through the pipeline, as far as the
/// circuit breaker cares.
enum FeatureOutcome {
    Passed,
    Failed { critical: bool },
    RateLimited,
}

async fn track_loop(inner: Arc<Inner>, track: String) {
    info!(track, "track loop started");
    let mut consecutive_critical = 0u32;

    while !inner.is_stopping() {
        // 1. Resume barrier: another track owns the pipeline right now.
        if inner.resume_blocks(&track) {
            tokio::time::sleep(RESUME_POLL).await;
            continue;
        }

        // 2. Dequeue.
        let Ok(queues) = inner.queues_handle() else {
            break;
        };
        let Some(item) = queues.dequeue(&track) else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        // 3. Load the feature; a stale queue entry is logged and skipped.
        let feature = match inner.features.get_feature(item.feature_id) {
            Ok(Some(feature)) => feature,
            Ok(None) => {
                warn!(track, feature = item.feature_id, "queued feature missing from store");
                continue;
            }
            Err(e) => {
                warn!(track, feature = item.feature_id, error = %e, "feature store error");
                continue;
            }
        };

        // 4. Publish what this track is doing.
        inner.update_track(&track, |s| {
            s.current_feature = Some(feature.id);
            s.queued = queues.queued_count(&track);
        });

        let started = std::time::Instant::now();
        let outcome = process_feature(&inner, &track, &feature, &item).await;

        // A rate-limited resume is requeued, not done; the cross-track hold
        // stays in place until the feature actually settles.
        if item.is_resume
            && matches!(
                outcome,
                FeatureOutcome::Passed | FeatureOutcome::Failed { .. }
            )
        {
            inner.clear_resume_if(feature.id);
        }

        // 11. Critical-failure circuit breaker.
        let mut break_track = false;
        match &outcome {
            FeatureOutcome::Failed { critical: true } => {
                consecutive_critical += 1;
                if consecutive_critical >= CRITICAL_BREAK_THRESHOLD {
                    error!(track, "repeated critical infrastructure failures, pausing track");
                    inner.bus.publish(Event::TrackCriticalFailure {
                        track: track.clone(),
                        reason: format!(
                            "{consecutive_critical} consecutive critical failures"
                        ),
                    });
                    break_track = true;
                }
            }
            _ => consecutive_critical = 0,
        }

        let failed = matches!(outcome, FeatureOutcome::Failed { .. });
        inner.update_track(&track, |s| {
            s.current_feature = None;
            s.current_session = None;
            s.queued = queues.queued_count(&track);
            match outcome {
                FeatureOutcome::Passed => s.completed += 1,
                FeatureOutcome::Failed { .. } => s.failed += 1,
                _ => {}
            }
        });

        // 13. Always drop the worktree before the next feature.
        if let Err(e) = inner.workspace.cleanup_worktree(&track).await {
            warn!(track, error = %e, "worktree cleanup failed");
        }

        if break_track {
            break;
        }

        // 12. Pacing: a near-instant failure means something is wrong with
        // the environment, not the feature. Back off briefly.
        if failed && started.elapsed() < FAST_FAILURE_WINDOW {
            inner.sleep_with_stop(FAST_FAILURE_PAUSE).await;
        }
    }
    info!(track, "track loop exited");
}

/// Steps 5-10 of the per-track loop: branch, session, implementation run,
/// failure analysis, auto-commit, and the merge+verify window.
async fn process_feature(
    inner: &Arc<Inner>,
    track: &str,
    feature: &Feature,
    item: &QueueItem,
) -> FeatureOutcome {
    let config = inner.config.read().unwrap_or_else(|e| e.into_inner()).clone();

    // 5. Isolated worktree on the feature branch.
    let (branch, worktree) = match inner
        .workspace
        .prepare_branch(track, feature.id, &feature.name, item.is_retry)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            error!(track, feature = feature.id, error = %e, "branch preparation failed");
            inner.mark_feature(
                feature.id,
                FeatureStatus::Failed,
                Some(truncate(&e.to_string(), 200)),
                Some(FailureKind::Environment),
                None,
            );
            return FeatureOutcome::Failed { critical: false };
        }
    };

    // Build the implementation prompt.
    let mut vars = PromptVars::for_feature(
        feature,
        &worktree,
        &inner.project_dir,
        &config.app_url,
        &config.base_branch,
        &config.instructions_path,
    );
    let template = prompts::resolve_template(
        &inner.project_dir,
        Phase::Implementation,
        &config.prompts,
    );
    let mut prompt = prompts::render(&template, &vars);
    if !item.extra_context.is_empty() {
        prompt.push_str("\n\n## Notes from the operator\n");
        prompt.push_str(&item.extra_context);
    }

    // 6. Session record, status running.
    let mut record = SessionRecord::start(feature.id, track, &branch, &prompt);
    if !item.extra_context.is_empty() {
        record.extra_context = Some(item.extra_context.clone());
    }
    let session_id = record.id.clone();
    let session_started = record.started_at;
    if let Err(e) = inner.sessions.create_session(record) {
        warn!(error = %e, "failed to record session");
    }
    inner.update_track(track, |s| s.current_session = Some(session_id.clone()));
    inner.bus.publish(Event::SessionStarted {
        session_id: session_id.clone(),
        feature_id: feature.id,
        track: track.into(),
    });

    // 7. Run the implementation agent.
    let result = inner
        .executor
        .execute_session(
            &prompt,
            &worktree,
            inner.stop_predicate(),
            inner.message_sink(&session_id),
        )
        .await;

    // 8. Failure analysis.
    if !result.success {
        let analysis = analyze_failure(&config.critical_patterns, &analysis_text(&result));

        if analysis.kind == AnalyzedKind::RateLimit {
            // The feature stays open; it goes to the front of the line once
            // the limits lift.
            info!(track, feature = feature.id, "rate-limited, requeueing for resume");
            finish_session(
                inner,
                &session_id,
                session_started,
                SessionStatus::Failed,
                &result,
            );
            if let Ok(queues) = inner.queues_handle() {
                queues.enqueue_resume(
                    feature.id,
                    track,
                    &item.extra_context,
                    Some(session_id.clone()),
                );
            }
            inner
                .sleep_with_stop(Duration::from_millis(config.agent.rate_limit_wait_ms))
                .await;
            return FeatureOutcome::RateLimited;
        }

        error!(track, feature = feature.id, reason = %analysis.reason, "implementation failed");
        finish_session(
            inner,
            &session_id,
            session_started,
            SessionStatus::Failed,
            &result,
        );
        inner.mark_feature(
            feature.id,
            FeatureStatus::Failed,
            Some(analysis.reason.clone()),
            Some(analysis.kind.as_failure_kind()),
            None,
        );
        inner.append_progress(feature, &format!("failed ({})", analysis.reason));
        return FeatureOutcome::Failed {
            critical: analysis.is_critical,
        };
    }

    // 9. Auto-commit whatever the agent left dirty.
    let commit_message = format!("feature {}: {}", feature.id, feature.name);
    if let Err(e) = inner
        .workspace
        .commit_all_if_dirty(&worktree, &commit_message)
        .await
    {
        error!(track, feature = feature.id, error = %e, "auto-commit failed");
        record_system_note(inner, &session_id, format!("auto-commit failed: {e}"));
        finish_session(
            inner,
            &session_id,
            session_started,
            SessionStatus::Error,
            &result,
        );
        inner.mark_feature(
            feature.id,
            FeatureStatus::Failed,
            Some(truncate(&e.to_string(), 200)),
            Some(FailureKind::Implementation),
            None,
        );
        return FeatureOutcome::Failed { critical: false };
    }

    let ahead = match inner.workspace.get_branch_status(&branch, &worktree).await {
        Ok(status) => status.ahead,
        Err(e) => {
            warn!(error = %e, "branch status failed, assuming no commits");
            0
        }
    };
    if ahead == 0 {
        // An agent that claims success but produced nothing will do it
        // again for every feature; do not spin.
        error!(track, feature = feature.id, "agent run produced no commits");
        record_system_note(
            inner,
            &session_id,
            "agent exited successfully but the branch has no commits",
        );
        finish_session(
            inner,
            &session_id,
            session_started,
            SessionStatus::Failed,
            &result,
        );
        inner.mark_feature(
            feature.id,
            FeatureStatus::Failed,
            Some("agent run produced no commits".into()),
            Some(FailureKind::Implementation),
            None,
        );
        inner.append_progress(feature, "failed (no commits produced)");
        inner.begin_stop("implementation produced no commits");
        return FeatureOutcome::Failed { critical: false };
    }

    finish_session(
        inner,
        &session_id,
        session_started,
        SessionStatus::Passed,
        &result,
    );

    // 10. Merge + verify under the global verification mutex.
    vars.worktree = worktree.display().to_string();
    let passed = verify_and_merge(
        inner,
        &config,
        feature,
        &session_id,
        &branch,
        &worktree,
        &vars,
    )
    .await;

    if passed {
        FeatureOutcome::Passed
    } else {
        FeatureOutcome::Failed { critical: false }
    }
}

fn analysis_text(result: &ExecutionResult) -> String {
    // After a fallback sequence the concatenated log contains every failed
    // attempt; classify on the last attempt's refined capture instead.
    let output = result
        .refined_output
        .as_deref()
        .unwrap_or(&result.output);
    let error = result
        .refined_error
        .clone()
        .or_else(|| result.error.clone())
        .unwrap_or_default();
    format!("{output}\n{}\n{error}", result.stderr_tail)
}

fn finish_session(
    inner: &Arc<Inner>,
    session_id: &str,
    started_at: DateTime<Utc>,
    status: SessionStatus,
    result: &ExecutionResult,
) {
    let mut update = SessionUpdate::finished(status, started_at);
    update.output = Some(result.output.clone());
    update.messages = Some(result.messages.clone());
    update.error = result.error.clone();
    update.agent_used = Some(result.agent_used.as_str().to_string());
    if let Err(e) = inner.sessions.update_session(session_id, update) {
        warn!(session = session_id, error = %e, "failed to update session");
    }
    if let Ok(Some(record)) = inner.sessions.get_session(session_id) {
        inner.bus.publish(Event::SessionFinished {
            session_id: session_id.to_string(),
            feature_id: record.feature_id,
            track: record.track,
            status,
        });
    }
}

fn record_system_note(inner: &Arc<Inner>, session_id: &str, note: impl Into<String>) {
    let message = AgentMessage::system_note(note);
    inner.bus.publish(Event::AgentOutput {
        session_id: session_id.to_string(),
        message: message.clone(),
    });
    if let Err(e) = inner.sessions.append_message(session_id, message) {
        warn!(session = session_id, error = %e, "failed to append system note");
    }
}

/// The merge-verify window (§ the hardest subflow): refresh the feature
/// branch, merge and push, then verify and fix up to `max_attempts` times,
/// all while holding the global verification mutex so only one track
/// touches base at a time. Merged code stays merged even when verification
/// never passes; later features build on it instead of re-implementing.
async fn verify_and_merge(
    inner: &Arc<Inner>,
    config: &ProjectConfig,
    feature: &Feature,
    session_id: &str,
    branch: &str,
    worktree: &std::path::Path,
    vars: &PromptVars,
) -> bool {
    let _window = inner.verification_mutex.lock().await;
    let max_attempts = if config.verification.disabled {
        1
    } else {
        config.verification.max_attempts.max(1)
    };

    for attempt in 1..=max_attempts {
        info!(feature = feature.id, attempt, "merge+verify attempt");

        // 1. Fold the latest base into the feature branch. A conflict here
        // is not fatal; the real merge below has the final say.
        if let Err(e) = inner.workspace.update_feature_branch(worktree).await {
            warn!(feature = feature.id, error = %e, "feature branch refresh failed");
            record_system_note(
                inner,
                session_id,
                format!("feature branch refresh failed, proceeding to merge: {e}"),
            );
        }

        // 2. Merge into base and push. Failure here means the shared branch
        // is not in a continuable state.
        if let Err(e) = inner.workspace.merge_locally(branch).await {
            error!(feature = feature.id, error = %e, "merge into base failed");
            inner.mark_feature(
                feature.id,
                FeatureStatus::Failed,
                Some(truncate(&e.to_string(), 200)),
                Some(FailureKind::Verification),
                None,
            );
            inner.append_progress(feature, "failed (merge conflict)");
            inner.begin_stop("merge into base failed");
            return false;
        }
        if let Err(e) = inner.workspace.push_base_branch().await {
            error!(feature = feature.id, error = %e, "push failed");
            inner.mark_feature(
                feature.id,
                FeatureStatus::Failed,
                Some(truncate(&e.to_string(), 200)),
                Some(FailureKind::Verification),
                None,
            );
            inner.append_progress(feature, "failed (push failed)");
            inner.begin_stop("push of base branch failed");
            return false;
        }

        // 3. Verification can be turned off entirely.
        if config.verification.disabled {
            inner.mark_feature(
                feature.id,
                FeatureStatus::Passed,
                None,
                None,
                Some("merged without verification".into()),
            );
            inner.append_progress(feature, "passed (verification disabled)");
            return true;
        }

        // 4-5. Announce, then give the app a moment to pick up the merge.
        inner.mark_feature(feature.id, FeatureStatus::Verifying, None, None, None);
        inner
            .sleep_with_stop(Duration::from_millis(config.verification.delay_ms))
            .await;

        // 6. Verification agent, restricted tools, project root.
        let template =
            prompts::resolve_template(&inner.project_dir, Phase::Verification, &config.prompts);
        let verify_prompt = prompts::render(&template, vars);
        let mut record =
            SessionRecord::start(feature.id, "verification", branch, &verify_prompt);
        let verify_session = record.id.clone();
        let verify_started = record.started_at;
        record.status = SessionStatus::Running;
        if let Err(e) = inner.sessions.create_session(record) {
            warn!(error = %e, "failed to record verification session");
        }
        inner.bus.publish(Event::SessionStarted {
            session_id: verify_session.clone(),
            feature_id: feature.id,
            track: "verification".into(),
        });

        let result = inner
            .executor
            .execute_verification(
                &verify_prompt,
                inner.stop_predicate(),
                inner.message_sink(&verify_session),
            )
            .await;

        // 7. A zero exit does not mean pass; the transcript decides.
        let failed = !result.success || verification_failed(&result.output);
        finish_session(
            inner,
            &verify_session,
            verify_started,
            if failed { SessionStatus::Failed } else { SessionStatus::Passed },
            &result,
        );

        if !failed {
            // 8. Done.
            inner.mark_feature(
                feature.id,
                FeatureStatus::Passed,
                None,
                None,
                Some(format!("verified on attempt {attempt}")),
            );
            inner.append_progress(feature, "passed");
            return true;
        }

        // 9. Failed: run a fix agent if there is another attempt coming.
        let reason = failed_step_lines(&result.output);
        warn!(feature = feature.id, attempt, reason = %reason, "verification failed");

        if attempt < max_attempts && !inner.is_stopping() {
            let template =
                prompts::resolve_template(&inner.project_dir, Phase::Fix, &config.prompts);
            let mut fix_vars = vars.clone();
            fix_vars.verify_output = tail(&result.output, CONTEXT_TAIL_CHARS);
            let fix_prompt = prompts::render(&template, &fix_vars);

            let record = SessionRecord::start(feature.id, "fix", branch, &fix_prompt);
            let fix_session = record.id.clone();
            let fix_started = record.started_at;
            if let Err(e) = inner.sessions.create_session(record) {
                warn!(error = %e, "failed to record fix session");
            }
            inner.bus.publish(Event::SessionStarted {
                session_id: fix_session.clone(),
                feature_id: feature.id,
                track: "fix".into(),
            });

            let fix_result = inner
                .executor
                .execute_fix(
                    &fix_prompt,
                    worktree,
                    inner.stop_predicate(),
                    inner.message_sink(&fix_session),
                )
                .await;

            finish_session(
                inner,
                &fix_session,
                fix_started,
                if fix_result.success {
                    SessionStatus::Passed
                } else {
                    SessionStatus::Failed
                },
                &fix_result,
            );

            // Whatever the fix agent says, keep its edits and go around.
            let message = format!("fix attempt {attempt} for feature {}", feature.id);
            if let Err(e) = inner
                .workspace
                .commit_all_if_dirty(worktree, &message)
                .await
            {
                error!(feature = feature.id, error = %e, "commit after fix failed");
                inner.mark_feature(
                    feature.id,
                    FeatureStatus::Failed,
                    Some(truncate(&e.to_string(), 200)),
                    Some(FailureKind::Verification),
                    None,
                );
                inner.begin_stop("commit after fix agent failed");
                return false;
            }
        }
    }

    // Exhausted. The merged code stays on base by design.
    inner.mark_feature(
        feature.id,
        FeatureStatus::Failed,
        Some("verification did not pass within the attempt budget".into()),
        Some(FailureKind::Verification),
        None,
    );
    inner.append_progress(feature, "failed (verification exhausted)");
    false
}
