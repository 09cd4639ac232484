//! Tutor notification
//!
//! Sent once per finished collection archive. Failures are reported to the
//! caller and never undo the archive.

use async_trait::async_trait;
use handlebars::Handlebars;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSendmailTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

pub const SUBJECT: &str = "Submission-Zip";

const TEMPLATE_NAME: &str = "tutor_notice";
const TEMPLATE: &str = "Hi {{tutor_name}},
the deadline for the exercise sheet '{{sheet_name}}' is over. We have collected all submissions in a single zip file.
Please log in to grade these solutions.
";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TutorNotice {
    pub tutor_name: String,
    pub tutor_email: String,
    pub sheet_name: String,
    pub archive_name: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("cannot render notification: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("cannot build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("sendmail failed: {0}")]
    Transport(#[from] lettre::transport::sendmail::Error),
}

#[async_trait]
pub trait TutorNotifier: Send + Sync {
    async fn notify(&self, notice: &TutorNotice) -> Result<(), NotifyError>;
}

/// Renders the plain-text notification body
pub struct NoticeTemplate {
    registry: Handlebars<'static>,
}

impl NoticeTemplate {
    pub fn new() -> Result<Self, handlebars::TemplateError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string(TEMPLATE_NAME, TEMPLATE)?;
        Ok(Self { registry })
    }

    pub fn render(&self, notice: &TutorNotice) -> Result<String, NotifyError> {
        Ok(self.registry.render(TEMPLATE_NAME, notice)?)
    }
}

/// Delivers through the local sendmail binary
pub struct SendmailNotifier {
    template: NoticeTemplate,
    from: Mailbox,
    transport: AsyncSendmailTransport<Tokio1Executor>,
}

impl SendmailNotifier {
    pub fn new(template: NoticeTemplate, from: &str, sendmail_binary: &Path) -> Result<Self, NotifyError> {
        Ok(Self {
            template,
            from: from.parse()?,
            transport: AsyncSendmailTransport::<Tokio1Executor>::new_with_command(sendmail_binary),
        })
    }
}

#[async_trait]
impl TutorNotifier for SendmailNotifier {
    async fn notify(&self, notice: &TutorNotice) -> Result<(), NotifyError> {
        let body = self.template.render(notice)?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(notice.tutor_email.parse()?)
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(body)?;

        self.transport.send(message).await?;
        tracing::info!(to = %notice.tutor_email, archive = %notice.archive_name, "Notified tutor");
        Ok(())
    }
}

/// Logs the rendered mail instead of sending it
pub struct LogNotifier {
    template: NoticeTemplate,
}

impl LogNotifier {
    pub fn new(template: NoticeTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl TutorNotifier for LogNotifier {
    async fn notify(&self, notice: &TutorNotice) -> Result<(), NotifyError> {
        let body = self.template.render(notice)?;
        tracing::info!(
            to = %notice.tutor_email,
            subject = SUBJECT,
            archive = %notice.archive_name,
            body = %body,
            "Tutor notification (sending disabled)"
        );
        Ok(())
    }
}
