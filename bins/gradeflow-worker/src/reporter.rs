//! Result Reporter
//!
//! POSTs the result payload to the callback URL of the job. A report that
//! does not reach the API is logged with everything needed to replay it by hand.

use gradeflow_common::{JobMessage, ResultPayload};
use reqwest::{Client, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("result endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("result endpoint answered {status}")]
    Rejected { status: StatusCode },
}

#[derive(Clone)]
pub struct ResultReporter {
    client: Client,
}

impl ResultReporter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn report(
        &self,
        message: &JobMessage,
        payload: &ResultPayload,
        exit_code: i64,
    ) -> Result<(), ReportError> {
        let result = self.send(message, payload).await;

        match &result {
            Ok(()) => tracing::info!(
                submission_id = message.submission_id,
                visibility = %message.visibility(),
                status = %payload.status,
                "Reported result"
            ),
            Err(e) => tracing::error!(
                submission_id = message.submission_id,
                visibility = %message.visibility(),
                image = %message.docker_image,
                callback = %message.result_endpoint_url,
                exit_code,
                error = %e,
                "Failed to report result"
            ),
        }
        result
    }

    async fn send(&self, message: &JobMessage, payload: &ResultPayload) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&message.result_endpoint_url)
            .bearer_auth(&message.access_token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ReportError::Rejected { status })
        }
    }
}
