//! Run outcome evaluation
//!
//! Turns whatever the runner produced into the status and log a student is
//! allowed to see. Knows nothing about Docker, HTTP or the broker.
//!
//! **Rules:**
//! - Success iff the container ran and exited with [`SUCCESS_EXIT_CODE`]
//! - On success the log is the text between the worker delimiters
//! - On failure the log is a fixed notice naming the submission and exit code;
//!   raw container output never reaches the student

use crate::runner::{RunOutput, RunnerError};
use gradeflow_common::TestStatus;

pub const LOG_BEGIN: &str = "--- BEGIN --- INFOMARK -- WORKER";
pub const LOG_END: &str = "--- END --- INFOMARK -- WORKER";

pub const SUCCESS_EXIT_CODE: i64 = 0;

/// Exit code reported when the container never produced one
pub const NO_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: TestStatus,
    pub log: String,
    pub exit_code: i64,
}

/// Cut the student-visible part out of the container output.
///
/// Without a begin marker the whole output is used; without an end marker
/// everything after the begin marker is.
pub fn student_log(output: &str) -> String {
    let body = match output.find(LOG_BEGIN) {
        Some(start) => {
            let rest = &output[start + LOG_BEGIN.len()..];
            match rest.find(LOG_END) {
                Some(end) => &rest[..end],
                None => rest,
            }
        }
        None => output,
    };
    body.trim().to_string()
}

pub fn failure_log(submission_id: i64, exit_code: i64, timed_out: bool) -> String {
    let mut log = format!(
        "There has been an issue during testing your upload (The ID is {}). \
         The testing-framework has failed (not the server). Exit code: {}",
        submission_id, exit_code
    );
    if timed_out {
        log.push_str(". The tests did not finish within the time limit.");
    }
    log
}

pub fn evaluate(submission_id: i64, run: &Result<RunOutput, RunnerError>) -> Verdict {
    match run {
        Ok(output) if output.exit_code == SUCCESS_EXIT_CODE => Verdict {
            status: TestStatus::Success,
            log: student_log(&output.output),
            exit_code: output.exit_code,
        },
        Ok(output) => Verdict {
            status: TestStatus::Failed,
            log: failure_log(submission_id, output.exit_code, false),
            exit_code: output.exit_code,
        },
        Err(RunnerError::Timeout(_)) => Verdict {
            status: TestStatus::Failed,
            log: failure_log(submission_id, NO_EXIT_CODE, true),
            exit_code: NO_EXIT_CODE,
        },
        Err(_) => Verdict {
            status: TestStatus::Failed,
            log: failure_log(submission_id, NO_EXIT_CODE, false),
            exit_code: NO_EXIT_CODE,
        },
    }
}
