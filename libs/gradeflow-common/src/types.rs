use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which half of a grade a job addresses.
/// Public and private runs of the same submission are fully independent jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    /// Both visibilities, in the order jobs are published
    pub fn all_variants() -> &'static [Visibility] {
        &[Visibility::Public, Visibility::Private]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    /// Recover the visibility from a result callback such as
    /// `.../grades/7/private_result`.
    pub fn from_result_url(url: &str) -> Option<Visibility> {
        let last = url.trim_end_matches('/').rsplit('/').next()?;
        match last {
            "public_result" => Some(Visibility::Public),
            "private_result" => Some(Visibility::Private),
            _ => None,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            _ => Err(MessageError::UnknownVisibility(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed job message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("job message field `{0}` is empty")]
    MissingField(&'static str),
    #[error("job message checksum `{0}` is not a SHA-256 hex digest")]
    InvalidChecksum(String),
    #[error("unknown visibility `{0}`")]
    UnknownVisibility(String),
}

/// Where a submission lives on the grading API.
/// Used to derive the three URLs of a job message.
#[derive(Debug, Clone)]
pub struct SubmissionTarget {
    pub api_url: String,
    pub course_id: i64,
    pub task_id: i64,
    pub submission_id: i64,
    pub grade_id: i64,
}

/// Job Message (Immutable)
///
/// One grading request. Written once by the producer, never mutated;
/// two of them exist per submission, one per [`Visibility`].
///
/// The wire form is the JSON object
/// `{submission_id, access_token, framework_file_url, submission_file_url,
///   result_endpoint_url, docker_image, sha_256, enqueued_at}`
/// plus the optional `grade_id` and `visibility` fields. Older producers
/// omit `visibility`; it is then recovered from the result URL.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub submission_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_id: Option<i64>,
    pub access_token: String,
    pub framework_file_url: String,
    pub submission_file_url: String,
    pub result_endpoint_url: String,
    pub docker_image: String,
    #[serde(rename = "sha_256")]
    pub sha256: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

impl JobMessage {
    /// Build the message the API publishes after an upload or re-trigger.
    pub fn for_submission(
        target: &SubmissionTarget,
        visibility: Visibility,
        access_token: &str,
        docker_image: &str,
        sha256: &str,
    ) -> Self {
        let api = target.api_url.trim_end_matches('/');
        Self {
            submission_id: target.submission_id,
            grade_id: Some(target.grade_id),
            access_token: access_token.to_string(),
            framework_file_url: format!(
                "{}/api/v1/courses/{}/tasks/{}/{}_file",
                api, target.course_id, target.task_id, visibility
            ),
            submission_file_url: format!(
                "{}/api/v1/courses/{}/submissions/{}/file",
                api, target.course_id, target.submission_id
            ),
            result_endpoint_url: format!(
                "{}/api/v1/courses/{}/grades/{}/{}_result",
                api, target.course_id, target.grade_id, visibility
            ),
            docker_image: docker_image.to_string(),
            sha256: sha256.to_lowercase(),
            enqueued_at: Utc::now(),
            visibility: Some(visibility),
        }
    }

    /// Parse and validate a delivery body.
    /// A returned message always carries an explicit visibility.
    pub fn from_slice(body: &[u8]) -> Result<Self, MessageError> {
        let mut msg: JobMessage = serde_json::from_slice(body)?;
        msg.validate()?;
        if msg.visibility.is_none() {
            msg.visibility = Visibility::from_result_url(&msg.result_endpoint_url);
        }
        Ok(msg)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        let required = [
            ("access_token", &self.access_token),
            ("framework_file_url", &self.framework_file_url),
            ("submission_file_url", &self.submission_file_url),
            ("result_endpoint_url", &self.result_endpoint_url),
            ("docker_image", &self.docker_image),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(MessageError::MissingField(name));
            }
        }

        if self.sha256.len() != 64 || !self.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MessageError::InvalidChecksum(self.sha256.clone()));
        }

        if self.visibility.is_none()
            && Visibility::from_result_url(&self.result_endpoint_url).is_none()
        {
            return Err(MessageError::UnknownVisibility(
                self.result_endpoint_url.clone(),
            ));
        }

        Ok(())
    }

    /// Visibility of a validated message.
    pub fn visibility(&self) -> Visibility {
        self.visibility
            .or_else(|| Visibility::from_result_url(&self.result_endpoint_url))
            .unwrap_or(Visibility::Public)
    }
}

// access_token stays out of logs
impl fmt::Debug for JobMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMessage")
            .field("submission_id", &self.submission_id)
            .field("grade_id", &self.grade_id)
            .field("access_token", &"<redacted>")
            .field("framework_file_url", &self.framework_file_url)
            .field("submission_file_url", &self.submission_file_url)
            .field("result_endpoint_url", &self.result_endpoint_url)
            .field("docker_image", &self.docker_image)
            .field("sha256", &self.sha256)
            .field("enqueued_at", &self.enqueued_at)
            .field("visibility", &self.visibility)
            .finish()
    }
}

/// Test status codes shared with the grade store.
/// `0` means the framework ran and reported back, `1` means it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TestStatus {
    Success,
    Failed,
}

impl From<TestStatus> for u8 {
    fn from(status: TestStatus) -> u8 {
        match status {
            TestStatus::Success => 0,
            TestStatus::Failed => 1,
        }
    }
}

impl TryFrom<u8> for TestStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(TestStatus::Success),
            1 => Ok(TestStatus::Failed),
            other => Err(format!("unknown test status code {}", other)),
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Success => f.write_str("success"),
            TestStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Result payload posted back to the grading API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub log: String,
    pub status: TestStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
