//! Submission handling
//!
//! A handler turns one delivery body into a [`HandleOutcome`]; the pool maps
//! that outcome onto the broker (ack, dead-letter or requeue).
//!
//! **Grading steps:**
//! 1. Parse and validate the job message
//! 2. Download submission and framework with the job's bearer token
//! 3. Verify the submission checksum; a mismatch never reaches the runner
//! 4. Run the tests in the sandbox
//! 5. Evaluate and POST the result payload
//!
//! Scratch files live for exactly one job and are removed on every path.

use async_trait::async_trait;
use chrono::Utc;
use gradeflow_common::{JobMessage, ResultPayload};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;

use crate::download::{verify_sha256, Downloader, IntegrityError, ScratchFiles};
use crate::metrics::WorkerMetrics;
use crate::outcome;
use crate::reporter::ResultReporter;
use crate::runner::{RunRequest, TestRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Processed, result delivered
    Completed,
    /// Must never be retried
    Rejected(String),
    /// Transient failure, worth another attempt
    Retry(String),
}

#[async_trait]
pub trait SubmissionHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> HandleOutcome;
}

/// Parses and acknowledges without doing work
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidHandler;

#[async_trait]
impl SubmissionHandler for VoidHandler {
    async fn handle(&self, body: &[u8]) -> HandleOutcome {
        match JobMessage::from_slice(body) {
            Ok(msg) => {
                tracing::debug!(submission_id = msg.submission_id, "Discarding delivery (void handler)");
                HandleOutcome::Completed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting unparseable job message");
                HandleOutcome::Rejected(e.to_string())
            }
        }
    }
}

pub struct GradingHandler {
    downloader: Downloader,
    reporter: ResultReporter,
    runner: Arc<dyn TestRunner>,
    workdir: PathBuf,
    max_memory_bytes: i64,
    metrics: WorkerMetrics,
}

impl GradingHandler {
    pub fn new(
        client: Client,
        runner: Arc<dyn TestRunner>,
        workdir: impl Into<PathBuf>,
        max_memory_bytes: i64,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            downloader: Downloader::new(client.clone()),
            reporter: ResultReporter::new(client),
            runner,
            workdir: workdir.into(),
            max_memory_bytes,
            metrics,
        }
    }

    async fn grade(&self, msg: &JobMessage) -> HandleOutcome {
        let visibility = msg.visibility();
        let scratch = ScratchFiles::new(&self.workdir);

        for (url, dest) in [
            (&msg.submission_file_url, &scratch.submission),
            (&msg.framework_file_url, &scratch.framework),
        ] {
            if let Err(e) = self.downloader.fetch(url, &msg.access_token, dest).await {
                tracing::warn!(
                    submission_id = msg.submission_id,
                    visibility = %visibility,
                    error = %e,
                    "Download failed"
                );
                return HandleOutcome::Retry(e.to_string());
            }
        }

        match verify_sha256(&scratch.submission, &msg.sha256).await {
            Ok(()) => {}
            Err(e @ IntegrityError::Mismatch { .. }) => {
                tracing::warn!(
                    submission_id = msg.submission_id,
                    visibility = %visibility,
                    error = %e,
                    "Submission failed integrity check"
                );
                return HandleOutcome::Rejected(e.to_string());
            }
            Err(e) => return HandleOutcome::Retry(e.to_string()),
        }

        let request = RunRequest {
            image: &msg.docker_image,
            submission: &scratch.submission,
            framework: &scratch.framework,
            max_memory_bytes: self.max_memory_bytes,
        };

        tracing::info!(
            submission_id = msg.submission_id,
            visibility = %visibility,
            image = %msg.docker_image,
            "Running tests"
        );
        let started_at = Utc::now();
        let run = self.runner.run(&request).await;
        let finished_at = Utc::now();

        if let Err(e) = &run {
            tracing::error!(
                submission_id = msg.submission_id,
                visibility = %visibility,
                image = %msg.docker_image,
                error = %e,
                "Test run did not complete"
            );
        }

        let verdict = outcome::evaluate(msg.submission_id, &run);
        self.metrics.record_job(
            visibility,
            verdict.status,
            (finished_at - started_at).to_std().unwrap_or_default(),
        );

        let payload = ResultPayload {
            log: verdict.log,
            status: verdict.status,
            enqueued_at: msg.enqueued_at,
            started_at,
            finished_at,
        };

        match self.reporter.report(msg, &payload, verdict.exit_code).await {
            Ok(()) => HandleOutcome::Completed,
            Err(e) => HandleOutcome::Retry(e.to_string()),
        }
    }
}

#[async_trait]
impl SubmissionHandler for GradingHandler {
    async fn handle(&self, body: &[u8]) -> HandleOutcome {
        match JobMessage::from_slice(body) {
            Ok(msg) => self.grade(&msg).await,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting unparseable job message");
                HandleOutcome::Rejected(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{LOG_BEGIN, LOG_END};
    use crate::runner::{RunOutput, RunnerError};
    use axum::{
        body::Bytes,
        extract::{Path as UrlPath, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use gradeflow_common::{
        ExecutionState, GradeRecord, SubmissionTarget, TestStatus, Visibility,
    };
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SUBMISSION: &[u8] = b"PK-student-upload";
    const FRAMEWORK: &[u8] = b"PK-unit-tests";

    #[derive(Clone)]
    struct FakeApi {
        grade: Arc<Mutex<GradeRecord>>,
        reports: Arc<Mutex<Vec<ResultPayload>>>,
        result_status: StatusCode,
    }

    async fn submission_file() -> Bytes {
        Bytes::from_static(SUBMISSION)
    }

    async fn framework_file(
        State(api): State<FakeApi>,
        UrlPath((_course, _task, kind)): UrlPath<(i64, i64, String)>,
    ) -> Bytes {
        let visibility = match kind.as_str() {
            "public_file" => Visibility::Public,
            _ => Visibility::Private,
        };
        api.grade.lock().unwrap().mark_running(visibility);
        Bytes::from_static(FRAMEWORK)
    }

    async fn receive_result(
        State(api): State<FakeApi>,
        UrlPath((_course, _grade, kind)): UrlPath<(i64, i64, String)>,
        Json(payload): Json<ResultPayload>,
    ) -> StatusCode {
        if api.result_status.is_success() {
            let visibility = match kind.as_str() {
                "public_result" => Visibility::Public,
                _ => Visibility::Private,
            };
            api.grade.lock().unwrap().apply_result(visibility, &payload);
            api.reports.lock().unwrap().push(payload);
        }
        api.result_status
    }

    async fn start_api(result_status: StatusCode) -> (String, FakeApi) {
        let api = FakeApi {
            grade: Arc::new(Mutex::new(GradeRecord::new(5, 42))),
            reports: Arc::new(Mutex::new(Vec::new())),
            result_status,
        };
        let router = Router::new()
            .route(
                "/api/v1/courses/:course/submissions/:id/file",
                get(submission_file),
            )
            .route("/api/v1/courses/:course/tasks/:task/:kind", get(framework_file))
            .route("/api/v1/courses/:course/grades/:grade/:kind", post(receive_result))
            .with_state(api.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), api)
    }

    type Script = Box<dyn Fn() -> Result<RunOutput, RunnerError> + Send + Sync>;

    struct ScriptedRunner {
        calls: AtomicUsize,
        script: Script,
    }

    impl ScriptedRunner {
        fn new(script: impl Fn() -> Result<RunOutput, RunnerError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Box::new(script),
            })
        }

        fn exiting(code: i64, output: String) -> Arc<Self> {
            Self::new(move || {
                Ok(RunOutput {
                    output: output.clone(),
                    exit_code: code,
                })
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(std::fs::read(request.submission).unwrap(), SUBMISSION);
            assert_eq!(std::fs::read(request.framework).unwrap(), FRAMEWORK);
            (self.script)()
        }
    }

    fn job(base: &str, visibility: Visibility, sha256: &str) -> Vec<u8> {
        let target = SubmissionTarget {
            api_url: base.to_string(),
            course_id: 1,
            task_id: 3,
            submission_id: 42,
            grade_id: 5,
        };
        JobMessage::for_submission(&target, visibility, "token", "grader:latest", sha256)
            .to_json()
            .unwrap()
            .into_bytes()
    }

    fn submission_sha() -> String {
        hex::encode(Sha256::digest(SUBMISSION))
    }

    fn handler(runner: Arc<ScriptedRunner>, workdir: &std::path::Path) -> GradingHandler {
        GradingHandler::new(
            Client::new(),
            runner,
            workdir,
            512 * 1024 * 1024,
            WorkerMetrics::new().unwrap(),
        )
    }

    fn is_empty(dir: &std::path::Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_passing_run_reports_student_log() {
        let (base, api) = start_api(StatusCode::OK).await;
        let workdir = tempfile::tempdir().unwrap();
        let output = format!("setup\n{}\n3/3 tests passed\n{}\nteardown", LOG_BEGIN, LOG_END);
        let runner = ScriptedRunner::exiting(0, output);

        let outcome = handler(runner.clone(), workdir.path())
            .handle(&job(&base, Visibility::Public, &submission_sha()))
            .await;

        assert_eq!(outcome, HandleOutcome::Completed);
        assert_eq!(runner.calls(), 1);
        let reports = api.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TestStatus::Success);
        assert_eq!(reports[0].log, "3/3 tests passed");
        assert!(reports[0].started_at <= reports[0].finished_at);
        assert!(is_empty(workdir.path()));
    }

    #[tokio::test]
    async fn test_failing_run_reports_sanitized_log() {
        let (base, api) = start_api(StatusCode::OK).await;
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::exiting(1, "Traceback: /secret/path".to_string());

        let outcome = handler(runner, workdir.path())
            .handle(&job(&base, Visibility::Private, &submission_sha()))
            .await;

        assert_eq!(outcome, HandleOutcome::Completed);
        let reports = api.reports.lock().unwrap();
        assert_eq!(reports[0].status, TestStatus::Failed);
        assert!(reports[0].log.contains("42"));
        assert!(reports[0].log.contains("Exit code: 1"));
        assert!(!reports[0].log.contains("Traceback"));
        assert!(is_empty(workdir.path()));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_failure() {
        let (base, api) = start_api(StatusCode::OK).await;
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|| Err(RunnerError::Timeout(std::time::Duration::from_secs(1))));

        let outcome = handler(runner, workdir.path())
            .handle(&job(&base, Visibility::Public, &submission_sha()))
            .await;

        assert_eq!(outcome, HandleOutcome::Completed);
        let reports = api.reports.lock().unwrap();
        assert_eq!(reports[0].status, TestStatus::Failed);
        assert!(reports[0].log.contains("time limit"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_never_runs() {
        let (base, api) = start_api(StatusCode::OK).await;
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::exiting(0, String::new());

        let outcome = handler(runner.clone(), workdir.path())
            .handle(&job(&base, Visibility::Public, &"f".repeat(64)))
            .await;

        assert!(matches!(outcome, HandleOutcome::Rejected(_)));
        assert_eq!(runner.calls(), 0);
        assert!(api.reports.lock().unwrap().is_empty());
        assert!(is_empty(workdir.path()));
    }

    #[tokio::test]
    async fn test_unparseable_message_is_rejected() {
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::exiting(0, String::new());
        let h = handler(runner.clone(), workdir.path());

        assert!(matches!(h.handle(b"not json").await, HandleOutcome::Rejected(_)));
        assert!(matches!(h.handle(b"{\"submission_id\": 1}").await, HandleOutcome::Rejected(_)));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_download_is_retried() {
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::exiting(0, String::new());

        let outcome = handler(runner.clone(), workdir.path())
            .handle(&job("http://127.0.0.1:1", Visibility::Public, &submission_sha()))
            .await;

        assert!(matches!(outcome, HandleOutcome::Retry(_)));
        assert_eq!(runner.calls(), 0);
        assert!(is_empty(workdir.path()));
    }

    #[tokio::test]
    async fn test_rejected_report_is_retried() {
        let (base, api) = start_api(StatusCode::INTERNAL_SERVER_ERROR).await;
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::exiting(0, "ok".to_string());

        let outcome = handler(runner, workdir.path())
            .handle(&job(&base, Visibility::Public, &submission_sha()))
            .await;

        assert!(matches!(outcome, HandleOutcome::Retry(_)));
        assert!(is_empty(workdir.path()));
        // picked up but never finished
        let grade = api.grade.lock().unwrap();
        assert_eq!(grade.public.execution_state, ExecutionState::Running);
        assert_eq!(grade.private.execution_state, ExecutionState::Enqueued);
    }

    #[tokio::test]
    async fn test_public_and_private_runs_fill_their_own_halves() {
        let (base, api) = start_api(StatusCode::OK).await;
        let workdir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|| {
            Ok(RunOutput {
                output: format!("{}\nfine\n{}", LOG_BEGIN, LOG_END),
                exit_code: 0,
            })
        });
        let h = handler(runner.clone(), workdir.path());

        let public = job(&base, Visibility::Public, &submission_sha());
        let private = job(&base, Visibility::Private, &submission_sha());
        let (a, b) = tokio::join!(h.handle(&public), h.handle(&private));

        assert_eq!(a, HandleOutcome::Completed);
        assert_eq!(b, HandleOutcome::Completed);
        assert_eq!(runner.calls(), 2);

        let grade = api.grade.lock().unwrap();
        for visibility in Visibility::all_variants() {
            let part = grade.part(*visibility);
            assert_eq!(part.execution_state, ExecutionState::Finished);
            assert_eq!(part.test_status, TestStatus::Success);
            assert_eq!(part.test_log, "fine");
        }
    }

    #[tokio::test]
    async fn test_void_handler_acks_valid_message() {
        let body = job("http://api.invalid", Visibility::Public, &submission_sha());
        assert_eq!(VoidHandler.handle(&body).await, HandleOutcome::Completed);
    }

    #[tokio::test]
    async fn test_void_handler_rejects_garbage() {
        let outcome = VoidHandler.handle(b"not json at all").await;
        assert!(matches!(outcome, HandleOutcome::Rejected(_)), "got {:?}", outcome);
    }
}
