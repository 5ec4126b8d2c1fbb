/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Success/failure notifications
//!
//! Delivery is best-effort by contract: the trigger retries a failed send at
//! most once, and the backup pipeline never lets a notification failure
//! change a run's outcome.

use crate::artifact::BackupClass;
use crate::config::NotificationConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

/// Outcome carried by a notification event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Success,
    Failure,
}

/// One event handed to the notification trigger, consumed exactly once
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    /// Class of the originating backup run; sweep and test events have none.
    pub class: Option<BackupClass>,
    pub outcome: EventOutcome,
    headline: String,
    pub message: String,
    /// Explicit attachment source; failure events without one fall back to
    /// the configured log file.
    pub attachment: Option<PathBuf>,
}

fn class_title(class: BackupClass) -> &'static str {
    match class {
        BackupClass::Daily => "Daily",
        BackupClass::Weekly => "Weekly",
        BackupClass::Monthly => "Monthly",
    }
}

impl NotificationEvent {
    pub fn backup_success(
        class: BackupClass,
        duration_secs: f64,
        size_bytes: u64,
        digest: &str,
        path: &Path,
    ) -> Self {
        Self {
            class: Some(class),
            outcome: EventOutcome::Success,
            headline: format!("{} Backup Successful", class_title(class)),
            message: format!(
                "{} backup completed successfully.\n\
                 Duration: {duration_secs:.2} seconds\n\
                 Size: {:.2} MB\n\
                 File: {}\n\
                 Checksum: {digest}",
                class_title(class),
                size_bytes as f64 / (1024.0 * 1024.0),
                path.display(),
            ),
            attachment: None,
        }
    }

    pub fn backup_failure(class: BackupClass, error: &BackupError) -> Self {
        let mut message = format!("Error: {error}");
        if let Some(stderr) = error.stderr() {
            message.push_str("\n\nDump tool output:\n");
            message.push_str(stderr);
        }
        Self {
            class: Some(class),
            outcome: EventOutcome::Failure,
            headline: format!("{} Backup Failed", class_title(class)),
            message,
            attachment: None,
        }
    }

    pub fn sweep_failure(detail: &str) -> Self {
        Self {
            class: None,
            outcome: EventOutcome::Failure,
            headline: "Retention Sweep Failed".to_string(),
            message: format!("Error: {detail}"),
            attachment: None,
        }
    }

    pub fn test() -> Self {
        Self {
            class: None,
            outcome: EventOutcome::Success,
            headline: "Test Notification".to_string(),
            message: "This is a test notification from the backup orchestrator.".to_string(),
            attachment: None,
        }
    }

    pub fn headline(&self) -> &str {
        &self.headline
    }
}

/// Rendered message handed to a sink
#[derive(Debug, Clone)]
pub struct SinkMessage {
    pub subject: String,
    pub body: String,
    pub attachment: Option<SinkAttachment>,
}

/// Attachment bytes for a sink message, already bounded
#[derive(Debug, Clone)]
pub struct SinkAttachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// External system receiving notifications; delivery is best-effort
#[async_trait]
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    async fn send(&self, message: &SinkMessage) -> Result<()>;
}

/// Sink used when no transport is configured; logs the event and succeeds
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, message: &SinkMessage) -> Result<()> {
        info!(subject = %message.subject, "notification transport disabled; event logged only");
        Ok(())
    }
}

/// Formats events and dispatches them to the configured sink
#[derive(Debug)]
pub struct NotificationTrigger {
    sink: Arc<dyn NotificationSink>,
    hostname: String,
    attach_log: Option<PathBuf>,
    max_attachment_bytes: u64,
}

impl NotificationTrigger {
    pub fn new(sink: Arc<dyn NotificationSink>, config: &NotificationConfig) -> Self {
        Self {
            sink,
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            attach_log: config.attach_log.clone(),
            max_attachment_bytes: config.max_attachment_bytes,
        }
    }

    /// Deliver one event, retrying a failed send at most once
    ///
    /// The returned error exists for callers that need the delivery outcome
    /// (the `test-notification` command); the backup pipeline logs it and
    /// moves on.
    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<()> {
        let message = self.render(event).await;
        match self.sink.send(&message).await {
            Ok(()) => {
                info!(subject = %message.subject, "notification delivered");
                Ok(())
            }
            Err(first) => {
                warn!(error = %first, "notification delivery failed; retrying once");
                match self.sink.send(&message).await {
                    Ok(()) => {
                        info!(subject = %message.subject, "notification delivered on retry");
                        Ok(())
                    }
                    Err(second) => {
                        warn!(error = %second, "notification delivery failed after retry; giving up");
                        Err(second)
                    }
                }
            }
        }
    }

    async fn render(&self, event: &NotificationEvent) -> SinkMessage {
        let subject = format!("[DB Backup] {} - {}", event.headline(), self.hostname);
        let body = format!(
            "Timestamp: {}\nHost: {}\n\n{}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            self.hostname,
            event.message,
        );
        let attachment = match event.outcome {
            EventOutcome::Failure => self.load_attachment(event).await,
            EventOutcome::Success => None,
        };
        SinkMessage {
            subject,
            body,
            attachment,
        }
    }

    async fn load_attachment(&self, event: &NotificationEvent) -> Option<SinkAttachment> {
        let source = event.attachment.as_ref().or(self.attach_log.as_ref())?;
        match read_tail(source, self.max_attachment_bytes).await {
            Ok(bytes) => Some(SinkAttachment {
                file_name: source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "log.txt".to_string()),
                bytes,
            }),
            Err(e) => {
                warn!(path = %source.display(), error = %e, "failed to read log excerpt for notification");
                None
            }
        }
    }
}

/// Read at most `cap` bytes from the end of a file
async fn read_tail(path: &Path, cap: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len > cap {
        file.seek(std::io::SeekFrom::End(-(cap as i64))).await?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(feature = "email")]
pub use self::smtp::SmtpSink;

#[cfg(feature = "email")]
mod smtp {
    use super::{NotificationSink, SinkMessage};
    use crate::config::{SmtpConfig, SmtpTls};
    use crate::error::{BackupError, Result};
    use async_trait::async_trait;
    use lettre::message::header::ContentType;
    use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

    /// SMTP notification sink
    #[derive(Debug)]
    pub struct SmtpSink {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        sender: Mailbox,
        recipients: Vec<Mailbox>,
    }

    impl SmtpSink {
        /// Build the sink from validated configuration
        ///
        /// Address and relay problems are configuration errors and surface
        /// here, at startup, not at delivery time.
        pub fn new(config: &SmtpConfig) -> Result<Self> {
            let sender = config.sender.parse::<Mailbox>().map_err(|e| {
                BackupError::configuration(format!("invalid smtp sender {:?}: {e}", config.sender))
            })?;
            let recipients = config
                .recipients
                .iter()
                .map(|r| {
                    r.parse::<Mailbox>().map_err(|e| {
                        BackupError::configuration(format!("invalid smtp recipient {r:?}: {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let builder = match config.tls {
                SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host),
                SmtpTls::Starttls => {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                }
                SmtpTls::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                    &config.host,
                )),
            }
            .map_err(|e| {
                BackupError::configuration(format!("invalid smtp relay {:?}: {e}", config.host))
            })?;

            let mut builder = builder.port(config.port);
            if let (Some(username), Some(password)) = (&config.username, &config.password) {
                builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
            }

            Ok(Self {
                transport: builder.build(),
                sender,
                recipients,
            })
        }
    }

    #[async_trait]
    impl NotificationSink for SmtpSink {
        async fn send(&self, message: &SinkMessage) -> Result<()> {
            let mut builder = Message::builder()
                .from(self.sender.clone())
                .subject(message.subject.clone());
            for recipient in &self.recipients {
                builder = builder.to(recipient.clone());
            }

            let email = match &message.attachment {
                Some(attachment) => builder.multipart(
                    MultiPart::mixed()
                        .singlepart(SinglePart::plain(message.body.clone()))
                        .singlepart(
                            Attachment::new(attachment.file_name.clone())
                                .body(attachment.bytes.clone(), ContentType::TEXT_PLAIN),
                        ),
                ),
                None => builder.body(message.body.clone()),
            }
            .map_err(|e| BackupError::notification(format!("failed to build message: {e}")))?;

            self.transport
                .send(email)
                .await
                .map_err(|e| BackupError::notification(format!("smtp delivery failed: {e}")))?;
            Ok(())
        }
    }
}
