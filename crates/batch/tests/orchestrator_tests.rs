//! Integration tests for the submit-then-poll orchestration.
//!
//! Uses a scripted in-memory backend so that submission failures,
//! pending jobs and history errors can be staged per job.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use avagen_batch::backend::GenerationBackend;
use avagen_batch::orchestrator::Orchestrator;
use avagen_comfyui::api::ComfyUIApiError;
use avagen_comfyui::history::ImageRef;
use avagen_comfyui::transfer::{ArtifactFetcher, FetchError};
use avagen_core::job_table::{build_job_requests, AvatarTable, JobRequest};
use avagen_core::types::JobId;
use avagen_core::workflow::JobGraphTemplate;
use serde_json::json;

const TICK: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// Reply to one history query.
#[derive(Debug, Clone, Copy)]
enum Reply {
    Pending,
    ServerError,
    NoArtifact,
}

#[derive(Default)]
struct State {
    /// 1-based submission numbers that answer without a prompt id.
    rejected: HashSet<usize>,
    submissions: usize,
    /// Replies served before a job reports its image.
    scripts: HashMap<String, VecDeque<Reply>>,
    /// Jobs whose history has already listed an image.
    ready: HashSet<String>,
    submitted_prefixes: Vec<String>,
    queries: Vec<String>,
    queried_after_ready: Vec<String>,
}

#[derive(Default)]
struct ScriptedBackend {
    state: Mutex<State>,
}

impl ScriptedBackend {
    fn reject_submission(self, n: usize) -> Self {
        self.state.lock().unwrap().rejected.insert(n);
        self
    }

    fn script(self, job_id: &str, replies: &[Reply]) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(job_id.to_string(), replies.iter().copied().collect());
        self
    }

    fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }
}

impl GenerationBackend for ScriptedBackend {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<JobId, ComfyUIApiError> {
        let mut state = self.state.lock().unwrap();
        state.submissions += 1;
        let n = state.submissions;
        let prefix = workflow["9"]["inputs"]["filename_prefix"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        state.submitted_prefixes.push(prefix);
        if state.rejected.contains(&n) {
            return Err(ComfyUIApiError::MissingPromptId);
        }
        Ok(format!("job-{n}"))
    }

    async fn get_history(&self, job_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(job_id.to_string());
        if state.ready.contains(job_id) {
            state.queried_after_ready.push(job_id.to_string());
        }

        let next = state.scripts.get_mut(job_id).and_then(VecDeque::pop_front);
        match next {
            Some(Reply::Pending) => Ok(json!({})),
            Some(Reply::ServerError) => Err(ComfyUIApiError::ApiError {
                status: 503,
                body: "unavailable".into(),
            }),
            Some(Reply::NoArtifact) => Ok(json!({ job_id: { "outputs": {} } })),
            None => {
                state.ready.insert(job_id.to_string());
                Ok(json!({
                    job_id: {
                        "outputs": {"9": {"images": [
                            {
                                "filename": format!("{job_id}_00001_.png"),
                                "subfolder": "",
                                "type": "output"
                            }
                        ]}},
                        "status": {"status_str": "success", "completed": true}
                    }
                }))
            }
        }
    }
}

/// Writes the remote filename into the destination file.
struct DiskFetcher;

impl ArtifactFetcher for DiskFetcher {
    async fn fetch(&self, image: &ImageRef, destination: &Path) -> Result<(), FetchError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, image.filename.as_bytes()).await?;
        Ok(())
    }
}

fn requests(labels: &[&str]) -> Vec<JobRequest> {
    labels
        .iter()
        .map(|label| JobRequest {
            prompt_text: format!("prompt for {label}"),
            seed: 1,
            label_prefix: format!("regen_{}", label.replace('/', "_")),
            destination_path: PathBuf::from("/unused").join(format!("{label}.png")),
            human_label: label.to_string(),
        })
        .collect()
}

/// Fetcher that only records calls, for tests that do not touch disk.
#[derive(Default)]
struct NullFetcher {
    calls: Mutex<Vec<PathBuf>>,
}

impl ArtifactFetcher for NullFetcher {
    async fn fetch(&self, _image: &ImageRef, destination: &Path) -> Result<(), FetchError> {
        self.calls.lock().unwrap().push(destination.to_path_buf());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn table_to_files_end_to_end() {
    let table = AvatarTable::from_json_str(
        r#"{"avatars": [
            {"id": "Y", "seed": 7, "base": "y", "home": "y at home"},
            {"id": "X", "seed": 42, "home": "x at home"}
        ]}"#,
        "test",
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let reqs = build_job_requests(&table, dir.path(), "regen");

    let backend = ScriptedBackend::default().script("job-2", &[Reply::Pending]);
    let template = JobGraphTemplate::flux_pixar();
    let summary = Orchestrator::new(&backend, &DiskFetcher, &template)
        .with_poll_interval(TICK)
        .run(&reqs)
        .await;

    assert_eq!(summary.total_requests, 3);
    assert_eq!(summary.queued, 3);
    assert_eq!(summary.completed, 3);
    assert!(summary.failed_to_queue.is_empty());

    assert_eq!(std::fs::read_to_string(dir.path().join("Y.png")).unwrap(), "job-1_00001_.png");
    assert_eq!(std::fs::read_to_string(dir.path().join("Y/home.png")).unwrap(), "job-2_00001_.png");
    assert_eq!(std::fs::read_to_string(dir.path().join("X/home.png")).unwrap(), "job-3_00001_.png");

    let prefixes = backend.state.lock().unwrap().submitted_prefixes.clone();
    assert_eq!(prefixes, ["regen_Y_base", "regen_Y_home", "regen_X_home"]);
}

#[tokio::test]
async fn submission_without_id_is_dropped_and_reported() {
    let backend = ScriptedBackend::default().reject_submission(2);
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(TICK)
        .run(&requests(&["a/home", "b/home", "c/home"]))
        .await;

    assert_eq!(summary.total_requests, 3);
    assert_eq!(summary.queued, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed_to_queue, ["b/home"]);
    // The rejected submission never gets polled.
    assert!(!backend.queries().contains(&"job-2".to_string()));
}

#[tokio::test]
async fn history_error_keeps_job_outstanding_until_next_sweep() {
    let backend = ScriptedBackend::default().script("job-1", &[Reply::ServerError]);
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(TICK)
        .run(&requests(&["cat/home"]))
        .await;

    assert_eq!(summary.completed, 1);
    assert_eq!(backend.queries(), ["job-1", "job-1"]);
    assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn collected_job_is_never_polled_again() {
    let backend = ScriptedBackend::default()
        .script("job-2", &[Reply::Pending, Reply::Pending, Reply::Pending]);
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(TICK)
        .run(&requests(&["a/home", "b/home"]))
        .await;

    assert_eq!(summary.completed, 2);
    assert!(backend.state.lock().unwrap().queried_after_ready.is_empty());
    // Sweep 1 checks both in submission order, later sweeps only job-2.
    assert_eq!(backend.queries(), ["job-1", "job-2", "job-2", "job-2", "job-2"]);
}

#[tokio::test]
async fn finished_without_image_is_retried_like_not_ready() {
    let backend = ScriptedBackend::default().script("job-1", &[Reply::NoArtifact, Reply::Pending]);
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(TICK)
        .run(&requests(&["a/home"]))
        .await;

    assert_eq!(summary.completed, 1);
    assert_eq!(backend.queries().len(), 3);
}

#[tokio::test]
async fn stuck_job_is_abandoned_after_max_attempts() {
    let backend = ScriptedBackend::default().script("job-1", &[Reply::Pending; 10]);
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(TICK)
        .with_max_poll_attempts(Some(3))
        .run(&requests(&["stuck/home", "fine/home"]))
        .await;

    assert_eq!(summary.queued, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.abandoned, ["stuck/home"]);
    let job1_polls = backend.queries().iter().filter(|q| *q == "job-1").count();
    assert_eq!(job1_polls, 3);
}

#[tokio::test]
async fn empty_batch_finishes_immediately() {
    let backend = ScriptedBackend::default();
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(Duration::from_secs(3600))
        .run(&[])
        .await;

    assert_eq!(summary, Default::default());
    assert!(backend.queries().is_empty());
}

#[tokio::test]
async fn all_submissions_failing_skips_polling() {
    let backend = ScriptedBackend::default()
        .reject_submission(1)
        .reject_submission(2);
    let fetcher = NullFetcher::default();
    let template = JobGraphTemplate::flux_pixar();

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(Duration::from_secs(3600))
        .run(&requests(&["a/home", "b/home"]))
        .await;

    assert_eq!(summary.queued, 0);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed_to_queue, ["a/home", "b/home"]);
    assert!(backend.queries().is_empty());
}
