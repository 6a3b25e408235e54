use async_trait::async_trait;
use milter::{Milter, MilterError, Modifier, Response};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Cfg;
use crate::filters::attachment::AttachmentFilter;
use crate::filters::spam::{Class, Classifier, ClassifierRun, BOGOSITY_HEADER};
use crate::inspect::Inspector;
use crate::metrics;

const QUARANTINE_REASON: &str = "local spam";

/// Filters shared by every session, built once from the configuration.
#[derive(Debug, Default)]
pub struct Filters {
    pub attachments: Option<AttachmentFilter>,
    pub spam: Option<Classifier>,
    pub local_hold: bool,
}

impl Filters {
    pub fn from_config(cfg: &Cfg) -> Self {
        let attachments = cfg.attachments.enabled.then(|| {
            AttachmentFilter::new(
                Inspector::new(cfg.attachments.policy(), cfg.attachments.limits()),
                cfg.attachments.on_error,
            )
        });
        let spam = cfg
            .spam
            .enabled
            .then(|| Classifier::new(&cfg.spam.bin, &cfg.spam.db));

        Filters {
            attachments,
            spam,
            local_hold: cfg.spam.local_hold,
        }
    }
}

/// Per-message milter state.
pub struct FilterSession {
    filters: Arc<Filters>,
    sender: String,
    multipart: bool,
    classified: bool,
    message: Option<Vec<u8>>,
    classifier: Option<ClassifierRun>,
}

impl FilterSession {
    pub fn new(filters: Arc<Filters>) -> Self {
        FilterSession {
            filters,
            sender: String::new(),
            multipart: false,
            classified: false,
            message: None,
            classifier: None,
        }
    }
}

fn callback_error(err: impl std::fmt::Display) -> MilterError {
    MilterError::CallbackError {
        message: err.to_string(),
    }
}

fn serialize_headers(headers: &[(String, String)]) -> Vec<u8> {
    let mut raw = Vec::new();
    for (name, value) in headers {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw
}

fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .get(..10)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/"))
}

#[async_trait]
impl Milter for FilterSession {
    async fn mail_from(&mut self, from: &str, _m: &mut Modifier) -> Result<Response, MilterError> {
        self.sender = from.to_string();
        Ok(Response::Continue)
    }

    async fn header(
        &mut self,
        name: &str,
        value: &str,
        _m: &mut Modifier,
    ) -> Result<Response, MilterError> {
        if name.eq_ignore_ascii_case("Content-Type") && is_multipart(value) {
            self.multipart = true;
        } else if name.eq_ignore_ascii_case(BOGOSITY_HEADER) {
            self.classified = true;
        }
        Ok(Response::Continue)
    }

    async fn headers(&mut self, m: &mut Modifier) -> Result<Response, MilterError> {
        let raw = serialize_headers(m.headers());

        if self.multipart && self.filters.attachments.is_some() {
            self.message = Some(raw.clone());
        }

        if let Some(classifier) = &self.filters.spam {
            if self.classified {
                debug!(sender = %self.sender, "message already classified");
            } else {
                let mut run = classifier.start().map_err(|err| {
                    warn!(error = ?err, "failed to start spam classifier");
                    callback_error(err)
                })?;
                run.write(&raw).await.map_err(callback_error)?;
                self.classifier = Some(run);
            }
        }

        if self.message.is_none() && self.classifier.is_none() {
            return Ok(Response::Accept);
        }
        Ok(Response::Continue)
    }

    async fn body_chunk(
        &mut self,
        chunk: &[u8],
        _m: &mut Modifier,
    ) -> Result<Response, MilterError> {
        if let Some(message) = self.message.as_mut() {
            message.extend_from_slice(chunk);
        }
        if let Some(run) = self.classifier.as_mut() {
            run.write(chunk).await.map_err(callback_error)?;
        }
        Ok(Response::Continue)
    }

    async fn body(&mut self, m: &mut Modifier) -> Result<Response, MilterError> {
        let queue_id = m.macro_value("i").unwrap_or("NOQUEUE").to_string();

        if let (Some(filter), Some(message)) = (&self.filters.attachments, self.message.take()) {
            if let Some(response) = filter.check(message, &queue_id).await.into_response() {
                return Ok(response);
            }
        }

        let Some(run) = self.classifier.take() else {
            return Ok(Response::Accept);
        };
        let Some(classification) = run.finish().await.map_err(|err| {
            warn!(%queue_id, error = ?err, "spam classification failed");
            callback_error(err)
        })?
        else {
            warn!(%queue_id, "classifier printed no verdict");
            return Ok(Response::Accept);
        };

        metrics::spam_classified(classification.class.label());
        m.add_header(BOGOSITY_HEADER, classification.header);

        if classification.class == Class::Spam {
            info!(%queue_id, sender = %self.sender, "detected spam");
            if self.filters.local_hold && m.header("Received").is_none() {
                info!(%queue_id, "holding locally submitted spam");
                m.quarantine(QUARANTINE_REASON);
                metrics::message_quarantined();
            }
        }
        Ok(Response::Accept)
    }

    async fn abort(&mut self) {
        self.message = None;
        // Dropping the run kills the classifier.
        self.classifier = None;
    }
}
