use std::time::Instant;
use tracing::{error, info, warn};

use super::FilterOutcome;
use crate::config::OnError;
use crate::inspect::{DenyReason, Inspector, Verdict, DENY_CODE};
use crate::metrics;

const UNINSPECTABLE_CODE: u16 = 554;
const UNINSPECTABLE_TEXT: &str = "Message rejected, attachments could not be inspected";

/// Runs the attachment inspector on complete messages.
#[derive(Debug, Clone)]
pub struct AttachmentFilter {
    inspector: Inspector,
    on_error: OnError,
}

impl AttachmentFilter {
    pub fn new(inspector: Inspector, on_error: OnError) -> Self {
        Self {
            inspector,
            on_error,
        }
    }

    /// Inspects a full message on the blocking pool.
    pub async fn check(&self, message: Vec<u8>, queue_id: &str) -> FilterOutcome {
        let inspector = self.inspector.clone();
        let size = message.len();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || inspector.inspect(&message)).await;
        metrics::observe_inspection(started.elapsed());

        match result {
            Ok(Ok(Verdict::Allow)) => {
                metrics::message_inspected("allow");
                FilterOutcome::Neutral
            }
            Ok(Ok(Verdict::Deny(reason))) => {
                match &reason {
                    DenyReason::Blacklisted {
                        filename,
                        extension,
                    } => info!(queue_id, size, %filename, %extension, "blacklisted attachment"),
                    DenyReason::NestingTooDeep { depth } => {
                        info!(queue_id, size, depth, "attachments nested too deep")
                    }
                    DenyReason::OversizedEntry { name } => {
                        info!(queue_id, size, %name, "oversized archive entry")
                    }
                    DenyReason::Uninspectable { name, reason } => {
                        info!(queue_id, size, %name, %reason, "nested archive cannot be inspected")
                    }
                }
                metrics::message_inspected(reason.label());
                FilterOutcome::Deny {
                    code: DENY_CODE,
                    text: reason.to_string(),
                }
            }
            Ok(Err(err)) => {
                warn!(queue_id, size, error = %err, "attachment inspection failed");
                metrics::message_inspected("error");
                self.error_outcome()
            }
            Err(err) => {
                error!(queue_id, error = %err, "attachment inspection task failed");
                metrics::message_inspected("error");
                self.error_outcome()
            }
        }
    }

    fn error_outcome(&self) -> FilterOutcome {
        match self.on_error {
            OnError::Tempfail => FilterOutcome::TempFail,
            OnError::Accept => FilterOutcome::Neutral,
            OnError::Reject => FilterOutcome::Deny {
                code: UNINSPECTABLE_CODE,
                text: UNINSPECTABLE_TEXT.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &[u8] = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n\
                           --b\r\nContent-Type: text/plain\r\n\r\nhello\r\n--b--\r\n";
    const DIRTY: &[u8] = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n\
                           --b\r\nContent-Disposition: attachment; filename=\"x.EXE\"\r\n\r\nMZ\r\n--b--\r\n";
    const BROKEN: &[u8] = b"Content-Type: multipart/mixed; boundary=b\r\n\r\n\
                            --b\r\nContent-Type: text/plain\r\n\r\nnever closed\r\n";

    #[tokio::test]
    async fn test_verdicts() {
        let filter = AttachmentFilter::new(Inspector::default(), OnError::Tempfail);
        assert_eq!(filter.check(CLEAN.to_vec(), "Q1").await, FilterOutcome::Neutral);
        assert_eq!(
            filter.check(DIRTY.to_vec(), "Q2").await,
            FilterOutcome::Deny {
                code: 552,
                text: "Message blocked due to blacklisted attachment".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_error_policy() {
        let tempfail = AttachmentFilter::new(Inspector::default(), OnError::Tempfail);
        assert_eq!(
            tempfail.check(BROKEN.to_vec(), "Q").await,
            FilterOutcome::TempFail
        );

        let accept = AttachmentFilter::new(Inspector::default(), OnError::Accept);
        assert_eq!(
            accept.check(BROKEN.to_vec(), "Q").await,
            FilterOutcome::Neutral
        );

        let reject = AttachmentFilter::new(Inspector::default(), OnError::Reject);
        assert!(matches!(
            reject.check(BROKEN.to_vec(), "Q").await,
            FilterOutcome::Deny { code: 554, .. }
        ));
    }
}
