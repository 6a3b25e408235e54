use miette::Diagnostic;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;

/// Header bogofilter prints in verbose mode and that we copy onto the message.
pub const BOGOSITY_HEADER: &str = "X-Bogosity";

/// Exit status bogofilter uses for I/O or database errors.
const EXIT_ERROR: i32 = 3;

#[derive(Debug, Error, Diagnostic)]
pub enum SpamError {
    #[error("failed to start classifier {bin}")]
    #[diagnostic(code(gatekeeper::spam::spawn))]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("classifier pipe error")]
    #[diagnostic(code(gatekeeper::spam::io))]
    Io(#[from] std::io::Error),

    #[error("classifier exited with an error status")]
    #[diagnostic(code(gatekeeper::spam::failed))]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Spam,
    Ham,
    Unsure,
}

impl Class {
    pub fn label(&self) -> &'static str {
        match self {
            Class::Spam => "spam",
            Class::Ham => "ham",
            Class::Unsure => "unsure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Header value as printed by the classifier, e.g. `Spam, tests=bogofilter, ...`.
    pub header: String,
    pub class: Class,
}

/// Spawns one bogofilter process per message.
#[derive(Debug, Clone)]
pub struct Classifier {
    bin: String,
    db: String,
}

impl Classifier {
    pub fn new(bin: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            db: db.into(),
        }
    }

    /// The bogofilter database directory.
    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn start(&self) -> Result<ClassifierRun, SpamError> {
        let mut child = Command::new(&self.bin)
            .arg("-v")
            .arg("-d")
            .arg(&self.db)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpamError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        Ok(ClassifierRun { child, stdin })
    }
}

/// A running classifier fed with the message as it arrives.
///
/// Dropping a run kills the process.
#[derive(Debug)]
pub struct ClassifierRun {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ClassifierRun {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), SpamError> {
        match self.stdin.as_mut() {
            Some(stdin) => Ok(stdin.write_all(data).await?),
            None => Err(SpamError::Io(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    /// Closes the input and waits for the verdict.
    pub async fn finish(self) -> Result<Option<Classification>, SpamError> {
        let ClassifierRun { child, stdin } = self;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if output.status.code() == Some(EXIT_ERROR) {
            return Err(SpamError::Failed);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let classification = parse_bogosity(&stdout);
        debug!(status = ?output.status, ?classification, "classifier finished");
        Ok(classification)
    }
}

/// Picks the `X-Bogosity:` line out of the classifier's output.
pub fn parse_bogosity(output: &str) -> Option<Classification> {
    let value = output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case(BOGOSITY_HEADER)
            .then(|| value.trim())
    })?;
    if value.is_empty() {
        return None;
    }

    let class = match value.split([',', ' ']).next() {
        Some("Spam") => Class::Spam,
        Some("Ham") => Class::Ham,
        _ => Class::Unsure,
    };
    Some(Classification {
        header: value.to_string(),
        class,
    })
}
