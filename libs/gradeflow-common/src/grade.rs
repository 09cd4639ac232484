//! Grade Record
//!
//! The store-side record a result callback lands in. The worker never
//! touches it directly; the grading API applies each [`ResultPayload`]
//! through [`GradeRecord::apply_result`], which only writes the half named
//! by the job's visibility. Public and private updates therefore commute.

use crate::types::{ResultPayload, TestStatus, Visibility};
use serde::{Deserialize, Serialize};

/// Lifecycle of one test pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ExecutionState {
    Enqueued,
    Running,
    Finished,
}

impl From<ExecutionState> for u8 {
    fn from(state: ExecutionState) -> u8 {
        match state {
            ExecutionState::Enqueued => 0,
            ExecutionState::Running => 1,
            ExecutionState::Finished => 2,
        }
    }
}

impl TryFrom<u8> for ExecutionState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ExecutionState::Enqueued),
            1 => Ok(ExecutionState::Running),
            2 => Ok(ExecutionState::Finished),
            other => Err(format!("unknown execution state {}", other)),
        }
    }
}

/// Per-visibility part of a grade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityGrade {
    pub execution_state: ExecutionState,
    pub test_status: TestStatus,
    pub test_log: String,
    pub acquired_points: i32,
    pub tutor_id: Option<i64>,
}

impl Default for VisibilityGrade {
    fn default() -> Self {
        Self {
            execution_state: ExecutionState::Enqueued,
            test_status: TestStatus::Failed,
            test_log: String::new(),
            acquired_points: 0,
            tutor_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub id: i64,
    pub submission_id: i64,
    pub public: VisibilityGrade,
    pub private: VisibilityGrade,
}

impl GradeRecord {
    pub fn new(id: i64, submission_id: i64) -> Self {
        Self {
            id,
            submission_id,
            public: VisibilityGrade::default(),
            private: VisibilityGrade::default(),
        }
    }

    pub fn part(&self, visibility: Visibility) -> &VisibilityGrade {
        match visibility {
            Visibility::Public => &self.public,
            Visibility::Private => &self.private,
        }
    }

    fn part_mut(&mut self, visibility: Visibility) -> &mut VisibilityGrade {
        match visibility {
            Visibility::Public => &mut self.public,
            Visibility::Private => &mut self.private,
        }
    }

    /// Mark a visibility as picked up by a worker
    pub fn mark_running(&mut self, visibility: Visibility) {
        self.part_mut(visibility).execution_state = ExecutionState::Running;
    }

    /// Store a worker result. Points and tutor stay with the tutor.
    pub fn apply_result(&mut self, visibility: Visibility, result: &ResultPayload) {
        let part = self.part_mut(visibility);
        part.execution_state = ExecutionState::Finished;
        part.test_status = result.status;
        part.test_log = result.log.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn payload(log: &str, status: TestStatus) -> ResultPayload {
        let now = Utc::now();
        ResultPayload {
            log: log.to_string(),
            status,
            enqueued_at: now,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_apply_result_touches_one_half() {
        let mut grade = GradeRecord::new(1, 42);
        grade.private.acquired_points = 5;
        grade.private.tutor_id = Some(9);

        grade.apply_result(Visibility::Public, &payload("3/3 tests passed", TestStatus::Success));

        assert_eq!(grade.public.execution_state, ExecutionState::Finished);
        assert_eq!(grade.public.test_status, TestStatus::Success);
        assert_eq!(grade.public.test_log, "3/3 tests passed");
        assert_eq!(grade.private.execution_state, ExecutionState::Enqueued);
        assert_eq!(grade.private.acquired_points, 5);
        assert_eq!(grade.private.tutor_id, Some(9));
    }

    #[test]
    fn test_running_then_finished() {
        let mut grade = GradeRecord::new(1, 42);

        grade.mark_running(Visibility::Private);
        assert_eq!(grade.private.execution_state, ExecutionState::Running);
        assert_eq!(grade.public.execution_state, ExecutionState::Enqueued);

        grade.apply_result(Visibility::Private, &payload("boom", TestStatus::Failed));
        assert_eq!(grade.private.execution_state, ExecutionState::Finished);
        assert_eq!(grade.private.test_status, TestStatus::Failed);
    }

    #[test]
    fn test_execution_state_codes() {
        assert_eq!(serde_json::to_string(&ExecutionState::Running).unwrap(), "1");
        assert_eq!(
            serde_json::from_str::<ExecutionState>("2").unwrap(),
            ExecutionState::Finished
        );
    }

    /// Every interleaving of a public and a private update sequence ends in the
    /// same record: each half holds its own last write.
    #[test]
    fn test_visibility_updates_commute_under_all_interleavings() {
        let public: Vec<ResultPayload> = (0..3)
            .map(|i| payload(&format!("public {}", i), TestStatus::Success))
            .collect();
        let private: Vec<ResultPayload> = (0..3)
            .map(|i| payload(&format!("private {}", i), TestStatus::Failed))
            .collect();

        // choose which 3 of the 6 slots are public writes
        let mut outcomes = Vec::new();
        for mask in 0u32..(1 << 6) {
            if mask.count_ones() != 3 {
                continue;
            }
            let mut grade = GradeRecord::new(1, 42);
            let (mut p, mut q) = (0, 0);
            for slot in 0..6 {
                if mask & (1 << slot) != 0 {
                    grade.apply_result(Visibility::Public, &public[p]);
                    p += 1;
                } else {
                    grade.apply_result(Visibility::Private, &private[q]);
                    q += 1;
                }
            }
            outcomes.push(grade);
        }

        assert_eq!(outcomes.len(), 20);
        for grade in &outcomes {
            assert_eq!(grade.public.test_log, "public 2");
            assert_eq!(grade.public.test_status, TestStatus::Success);
            assert_eq!(grade.private.test_log, "private 2");
            assert_eq!(grade.private.test_status, TestStatus::Failed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_cross_visibility() {
        let grade = Arc::new(Mutex::new(GradeRecord::new(1, 42)));
        let mut handles = Vec::new();

        for round in 0..50 {
            for visibility in Visibility::all_variants() {
                let grade = grade.clone();
                let visibility = *visibility;
                handles.push(tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    let log = format!("{}:{}", visibility, round);
                    let status = match visibility {
                        Visibility::Public => TestStatus::Success,
                        Visibility::Private => TestStatus::Failed,
                    };
                    grade
                        .lock()
                        .unwrap()
                        .apply_result(visibility, &payload(&log, status));
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let grade = grade.lock().unwrap();
        assert!(grade.public.test_log.starts_with("public:"));
        assert_eq!(grade.public.test_status, TestStatus::Success);
        assert!(grade.private.test_log.starts_with("private:"));
        assert_eq!(grade.private.test_status, TestStatus::Failed);
    }
}
