//! Background CLI job manager.
//!
//! Long CLI invocations are decoupled from the synchronous caller: the
//! submitter gets a tracking ID immediately, the job runs to completion (or
//! is force-terminated when it stops making progress) and results are
//! pushed out of band through the delivery channel. A failed job still
//! sends a delivery notification; there are no silent failures.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::delivery::{DeliveryOptions, DeliveryRequest, SharedDeliverySink};
use crate::error::RouterError;
use crate::providers::{CliExecOptions, ProviderRegistry};
use crate::request::TriggerContext;
use crate::workspace::{filter_generated_files, snapshot_workspace};

/// How often the watchdog checks a running job for progress.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

/// One background job. Owned exclusively by the manager from submission
/// until delivery completes; the caller only ever holds the tracking ID.
#[derive(Debug, Clone)]
pub struct CliJob {
    pub tracking_id: Uuid,
    pub cli_type: String,
    pub command: String,
    pub workspace: PathBuf,
    pub user_id: String,
    pub agentic_id: Option<String>,
    pub conversation_id: Option<String>,
    pub delivery_target: TriggerContext,
    pub timeout: Duration,
    pub stale_threshold: Duration,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub status: JobStatus,
}

/// What a caller provides when submitting a job.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub cli_type: String,
    pub command: String,
    pub workspace: PathBuf,
    pub user_id: String,
    pub agentic_id: Option<String>,
    pub conversation_id: Option<String>,
    pub delivery_target: TriggerContext,
    pub timeout: Duration,
}

struct JobState {
    job: CliJob,
    handle: Option<tokio::task::JoinHandle<()>>,
}

pub struct CliJobManager {
    jobs: Arc<RwLock<HashMap<Uuid, JobState>>>,
    registry: Arc<ProviderRegistry>,
    delivery: SharedDeliverySink,
    stale_threshold: Duration,
}

impl CliJobManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        delivery: SharedDeliverySink,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            registry,
            delivery,
            stale_threshold,
        }
    }

    /// Submit a job. Returns the tracking ID immediately; everything else
    /// happens in the background.
    pub async fn start_execution(&self, submission: JobSubmission) -> Result<Uuid, RouterError> {
        if submission.command.trim().is_empty() {
            return Err(RouterError::InvalidRequest(
                "CLI command must not be empty".to_string(),
            ));
        }

        let tracking_id = Uuid::new_v4();
        let job = CliJob {
            tracking_id,
            cli_type: submission.cli_type.clone(),
            command: submission.command.clone(),
            workspace: submission.workspace.clone(),
            user_id: submission.user_id.clone(),
            agentic_id: submission.agentic_id.clone(),
            conversation_id: submission.conversation_id.clone(),
            delivery_target: submission.delivery_target.clone(),
            timeout: submission.timeout,
            stale_threshold: self.stale_threshold,
            started_at: chrono::Utc::now(),
            status: JobStatus::Running,
        };

        tracing::info!(
            tracking_id = %tracking_id,
            cli = %submission.cli_type,
            workspace = %submission.workspace.display(),
            timeout = ?submission.timeout,
            "Background CLI job submitted"
        );

        // The entry must exist before the task runs, or a fast failure path
        // could write its terminal status into the void.
        self.jobs
            .write()
            .await
            .insert(tracking_id, JobState { job: job.clone(), handle: None });

        let jobs = Arc::clone(&self.jobs);
        let registry = Arc::clone(&self.registry);
        let delivery = Arc::clone(&self.delivery);
        let stale_threshold = self.stale_threshold;

        let handle = tokio::spawn(async move {
            run_to_completion(job, jobs, registry, delivery, stale_threshold).await;
        });

        let mut jobs = self.jobs.write().await;
        if let Some(state) = jobs.get_mut(&tracking_id) {
            if state.job.status == JobStatus::Cancelled {
                // Cancelled between insert and spawn; stop the task now.
                handle.abort();
            } else {
                state.handle = Some(handle);
            }
        }

        Ok(tracking_id)
    }

    /// Cancel a job by tracking ID. No partial results are delivered.
    pub async fn cancel(&self, tracking_id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(state) = jobs.get_mut(&tracking_id) else {
            return false;
        };
        if state.job.status != JobStatus::Running {
            return false;
        }
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.job.status = JobStatus::Cancelled;
        tracing::info!(tracking_id = %tracking_id, "Background CLI job cancelled");
        true
    }

    pub async fn status_of(&self, tracking_id: Uuid) -> Option<JobStatus> {
        self.jobs
            .read()
            .await
            .get(&tracking_id)
            .map(|state| state.job.status)
    }

    pub async fn job(&self, tracking_id: Uuid) -> Option<CliJob> {
        self.jobs
            .read()
            .await
            .get(&tracking_id)
            .map(|state| state.job.clone())
    }

    /// Tracking IDs of jobs still running (for diagnostics).
    pub async fn running_jobs(&self) -> Vec<Uuid> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|state| state.job.status == JobStatus::Running)
            .map(|state| state.job.tracking_id)
            .collect()
    }
}

/// Transition a job out of `Running`. Returns false when the job was
/// already terminal (cancellation wins over a racing completion, and the
/// caller must then deliver nothing).
async fn set_status(jobs: &RwLock<HashMap<Uuid, JobState>>, id: Uuid, status: JobStatus) -> bool {
    if let Some(state) = jobs.write().await.get_mut(&id) {
        if state.job.status == JobStatus::Running {
            state.job.status = status;
            return true;
        }
    }
    false
}

/// Workspace progress marker: file count plus newest modification time.
fn progress_marker(workspace: &std::path::Path) -> (usize, Option<std::time::SystemTime>) {
    let snapshot = snapshot_workspace(workspace);
    let newest = snapshot
        .iter()
        .filter_map(|path| path.metadata().ok())
        .filter_map(|meta| meta.modified().ok())
        .max();
    (snapshot.len(), newest)
}

async fn run_to_completion(
    job: CliJob,
    jobs: Arc<RwLock<HashMap<Uuid, JobState>>>,
    registry: Arc<ProviderRegistry>,
    delivery: SharedDeliverySink,
    stale_threshold: Duration,
) {
    let tracking_id = job.tracking_id;
    let before = snapshot_workspace(&job.workspace);

    let Some(adapter) = registry.get_cli(&job.cli_type) else {
        tracing::warn!(tracking_id = %tracking_id, cli = %job.cli_type, "No CLI adapter for job");
        if set_status(&jobs, tracking_id, JobStatus::Failed).await {
            deliver_text(
                &delivery,
                &job,
                format!("Background task failed: no {} CLI available.", job.cli_type),
            )
            .await;
        }
        return;
    };

    let exec_opts = CliExecOptions {
        workspace: job.workspace.clone(),
        model: None,
        timeout: job.timeout,
    };

    // The watchdog force-terminates the run when the workspace stops
    // changing for longer than the stale threshold. Execution and watchdog
    // race; whichever finishes first wins.
    let execution = {
        let exec = adapter.execute(&job.command, &exec_opts);
        tokio::pin!(exec);

        let mut last_marker = progress_marker(&job.workspace);
        let mut last_progress = tokio::time::Instant::now();
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        watchdog.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                result = &mut exec => break Some(result),
                _ = watchdog.tick() => {
                    let marker = progress_marker(&job.workspace);
                    if marker != last_marker {
                        last_marker = marker;
                        last_progress = tokio::time::Instant::now();
                    } else if last_progress.elapsed() > stale_threshold {
                        tracing::warn!(
                            tracking_id = %tracking_id,
                            stale_for = ?last_progress.elapsed(),
                            "Background CLI job made no progress, terminating"
                        );
                        break None;
                    }
                }
            }
        }
    };

    match execution {
        Some(Ok(execution)) => {
            if !set_status(&jobs, tracking_id, JobStatus::Completed).await {
                return;
            }

            let after = snapshot_workspace(&job.workspace);
            let mut created: HashSet<PathBuf> = after.difference(&before).cloned().collect();
            created.extend(execution.output_files.iter().cloned());
            let deliverables = filter_generated_files(created.into_iter().collect());

            let summary = if execution.content.trim().is_empty() {
                format!("Background task finished ({} files).", deliverables.len())
            } else {
                execution.content.clone()
            };
            deliver_text(&delivery, &job, summary).await;

            for file in deliverables {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| file.display().to_string());
                let request = DeliveryRequest {
                    account_id: job.delivery_target.account_id.clone(),
                    recipient: job.delivery_target.external_id.clone(),
                    platform: job.delivery_target.platform.clone(),
                    content: String::new(),
                    options: DeliveryOptions {
                        media: Some(file.clone()),
                        caption: Some(format!("Generated file: {}", name)),
                        mime_type: None,
                    },
                    source: "cli-jobs".to_string(),
                };
                if let Err(e) = delivery.enqueue(request).await {
                    tracing::warn!(
                        tracking_id = %tracking_id,
                        file = %file.display(),
                        error = %e,
                        "File delivery failed"
                    );
                }
            }
            tracing::info!(tracking_id = %tracking_id, "Background CLI job completed");
        }
        Some(Err(e)) => {
            let timed_out = matches!(e.kind, crate::error::FailureKind::Timeout);
            let status = if timed_out {
                JobStatus::TimedOut
            } else {
                JobStatus::Failed
            };
            tracing::warn!(tracking_id = %tracking_id, error = %e, "Background CLI job failed");
            if set_status(&jobs, tracking_id, status).await {
                deliver_text(
                    &delivery,
                    &job,
                    format!("Background task did not finish: {}", e),
                )
                .await;
            }
        }
        None => {
            // Watchdog fired. Dropping the execution future kills the child
            // process (spawned with kill-on-drop).
            if set_status(&jobs, tracking_id, JobStatus::TimedOut).await {
                deliver_text(
                    &delivery,
                    &job,
                    "Background task was terminated after making no progress for too long."
                        .to_string(),
                )
                .await;
            }
        }
    }
}

async fn deliver_text(delivery: &SharedDeliverySink, job: &CliJob, content: String) {
    let request = DeliveryRequest {
        account_id: job.delivery_target.account_id.clone(),
        recipient: job.delivery_target.external_id.clone(),
        platform: job.delivery_target.platform.clone(),
        content,
        options: DeliveryOptions::default(),
        source: "cli-jobs".to_string(),
    };
    if let Err(e) = delivery.enqueue(request).await {
        tracing::warn!(
            tracking_id = %job.tracking_id,
            error = %e,
            "Delivery of job result failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MemoryDeliverySink;
    use crate::error::ProviderError;
    use crate::providers::{
        ChatInvocation, ChatOutcome, CliAdapter, CliExecution, ProviderAdapter,
    };
    use async_trait::async_trait;

    /// CLI adapter whose `execute` is scripted for tests.
    struct FakeCli {
        id: &'static str,
        result: tokio::sync::Mutex<Option<Result<CliExecution, ProviderError>>>,
        delay: Duration,
    }

    impl FakeCli {
        fn new(id: &'static str, result: Result<CliExecution, ProviderError>) -> Self {
            Self {
                id,
                result: tokio::sync::Mutex::new(Some(result)),
                delay: Duration::from_millis(10),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeCli {
        fn id(&self) -> &str {
            self.id
        }

        async fn chat(&self, _invocation: ChatInvocation) -> Result<ChatOutcome, ProviderError> {
            Err(ProviderError::transport("not used in tests"))
        }

        async fn is_available(&self, _user_id: Option<&str>) -> bool {
            true
        }
    }

    #[async_trait]
    impl CliAdapter for FakeCli {
        async fn is_authenticated(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            _prompt: &str,
            _opts: &CliExecOptions,
        ) -> Result<CliExecution, ProviderError> {
            tokio::time::sleep(self.delay).await;
            self.result
                .lock()
                .await
                .take()
                .unwrap_or_else(|| Err(ProviderError::transport("script exhausted")))
        }
    }

    fn target() -> TriggerContext {
        TriggerContext {
            account_id: "acct".to_string(),
            external_id: "chat-1".to_string(),
            platform: "telegram".to_string(),
        }
    }

    fn submission(cli: &str, workspace: PathBuf) -> JobSubmission {
        JobSubmission {
            cli_type: cli.to_string(),
            command: "write a quarterly report".to_string(),
            workspace,
            user_id: "u1".to_string(),
            agentic_id: None,
            conversation_id: Some("c1".to_string()),
            delivery_target: target(),
            timeout: Duration::from_secs(600),
        }
    }

    async fn wait_for_terminal(manager: &CliJobManager, id: Uuid) -> JobStatus {
        for _ in 0..200 {
            if let Some(status) = manager.status_of(id).await {
                if status != JobStatus::Running {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn test_submission_returns_quickly_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_path_buf();
        let report = workspace.join("report.docx");

        let execution = CliExecution {
            content: "Report written.".to_string(),
            output_files: vec![report.clone()],
            workspace: workspace.clone(),
            duration: Duration::from_secs(1),
        };
        let mut registry = ProviderRegistry::new();
        registry.register_cli(Arc::new(FakeCli::new("cli-claude", Ok(execution))));

        let sink = Arc::new(MemoryDeliverySink::new());
        let manager = CliJobManager::new(
            Arc::new(registry),
            sink.clone(),
            Duration::from_secs(300),
        );

        let started = std::time::Instant::now();
        let id = manager
            .start_execution(submission("cli-claude", workspace))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        let status = wait_for_terminal(&manager, id).await;
        assert_eq!(status, JobStatus::Completed);

        let deliveries = sink.deliveries().await;
        // Text summary plus the file attachment.
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].content, "Report written.");
        assert_eq!(deliveries[1].options.media.as_ref().unwrap(), &report);
        assert!(deliveries[1]
            .options
            .caption
            .as_ref()
            .unwrap()
            .contains("report.docx"));
    }

    #[tokio::test]
    async fn test_script_files_filtered_from_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_path_buf();

        let execution = CliExecution {
            content: "Done.".to_string(),
            output_files: vec![workspace.join("gen.py"), workspace.join("report.docx")],
            workspace: workspace.clone(),
            duration: Duration::from_secs(1),
        };
        let mut registry = ProviderRegistry::new();
        registry.register_cli(Arc::new(FakeCli::new("cli-claude", Ok(execution))));

        let sink = Arc::new(MemoryDeliverySink::new());
        let manager = CliJobManager::new(
            Arc::new(registry),
            sink.clone(),
            Duration::from_secs(300),
        );

        let id = manager
            .start_execution(submission("cli-claude", workspace.clone()))
            .await
            .unwrap();
        wait_for_terminal(&manager, id).await;

        let deliveries = sink.deliveries().await;
        let attachments: Vec<_> = deliveries
            .iter()
            .filter_map(|d| d.options.media.as_ref())
            .collect();
        assert_eq!(attachments, vec![&workspace.join("report.docx")]);
    }

    #[tokio::test]
    async fn test_failed_job_still_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register_cli(Arc::new(FakeCli::new(
            "cli-claude",
            Err(ProviderError::cli_output("Error: model refused")),
        )));

        let sink = Arc::new(MemoryDeliverySink::new());
        let manager = CliJobManager::new(
            Arc::new(registry),
            sink.clone(),
            Duration::from_secs(300),
        );

        let id = manager
            .start_execution(submission("cli-claude", dir.path().to_path_buf()))
            .await
            .unwrap();
        let status = wait_for_terminal(&manager, id).await;
        assert_eq!(status, JobStatus::Failed);

        let deliveries = sink.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].content.contains("did not finish"));
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_with_notification() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryDeliverySink::new());
        let manager = CliJobManager::new(
            Arc::new(ProviderRegistry::new()),
            sink.clone(),
            Duration::from_secs(300),
        );

        let id = manager
            .start_execution(submission("cli-claude", dir.path().to_path_buf()))
            .await
            .unwrap();
        let status = wait_for_terminal(&manager, id).await;
        assert_eq!(status, JobStatus::Failed);
        assert!(!sink.deliveries().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_prevents_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_path_buf();
        let execution = CliExecution {
            content: "too late".to_string(),
            output_files: vec![],
            workspace: workspace.clone(),
            duration: Duration::from_secs(1),
        };
        let mut slow = FakeCli::new("cli-claude", Ok(execution));
        slow.delay = Duration::from_secs(30);
        let mut registry = ProviderRegistry::new();
        registry.register_cli(Arc::new(slow));

        let sink = Arc::new(MemoryDeliverySink::new());
        let manager = CliJobManager::new(
            Arc::new(registry),
            sink.clone(),
            Duration::from_secs(300),
        );

        let id = manager
            .start_execution(submission("cli-claude", workspace))
            .await
            .unwrap();
        assert!(manager.cancel(id).await);
        assert_eq!(manager.status_of(id).await, Some(JobStatus::Cancelled));

        // Give any racing completion path a moment; nothing may be
        // delivered for a cancelled job.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.deliveries().await.is_empty());
        assert!(!manager.cancel(id).await, "double-cancel is a no-op");
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CliJobManager::new(
            Arc::new(ProviderRegistry::new()),
            Arc::new(MemoryDeliverySink::new()),
            Duration::from_secs(300),
        );
        let mut sub = submission("cli-claude", dir.path().to_path_buf());
        sub.command = "   ".to_string();
        assert!(manager.start_execution(sub).await.is_err());
    }
}
