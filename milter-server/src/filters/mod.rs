use milter::Response;

pub mod attachment;
pub mod spam;

/// What a message filter wants done with the current message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// No objection; later filters still run.
    Neutral,
    /// Refuse with an SMTP reply.
    Deny { code: u16, text: String },
    /// Ask the MTA to try again later.
    TempFail,
}

impl FilterOutcome {
    /// Final milter response, or `None` when the message may continue.
    pub fn into_response(self) -> Option<Response> {
        match self {
            FilterOutcome::Neutral => None,
            FilterOutcome::Deny { code, text } => Some(Response::reply(code, text)),
            FilterOutcome::TempFail => Some(Response::TempFail),
        }
    }
}
