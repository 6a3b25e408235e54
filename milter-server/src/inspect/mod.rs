//! Attachment content inspection.
//!
//! [`Inspector::inspect`] walks a complete message (headers and body as
//! received over SMTP), descends through multiparts, embedded messages and
//! archives, and refuses anything carrying a blacklisted extension.

use miette::Diagnostic;
use std::sync::Arc;
use thiserror::Error;

pub mod archive;
mod decode;
mod message;
pub mod policy;

pub use policy::{ContainerKind, ExtensionPolicy, DEFAULT_BLACKLIST};

/// SMTP code used for every policy refusal.
pub const DENY_CODE: u16 = 552;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Archive nesting; the attachment itself is level 1.
    pub max_archive_depth: usize,
    /// Embedded message and multipart nesting below the top-level message.
    pub max_message_depth: usize,
    /// Largest nested archive entry read into memory.
    pub max_entry_size: u64,
    /// Total bytes of nested entries read during one inspection.
    pub max_expanded_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_archive_depth: 5,
            max_message_depth: 16,
            max_entry_size: 32 * 1024 * 1024,
            max_expanded_size: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

/// Why a message was refused. The display text is the SMTP reply text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("Message blocked due to blacklisted attachment")]
    Blacklisted { filename: String, extension: String },

    #[error("Message blocked due to excessively nested attachments")]
    NestingTooDeep { depth: usize },

    #[error("Message blocked due to oversized archive content")]
    OversizedEntry { name: String },

    #[error("Message blocked due to uninspectable archive content")]
    Uninspectable { name: String, reason: String },
}

impl DenyReason {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted { .. } => "blacklisted",
            DenyReason::NestingTooDeep { .. } => "nesting",
            DenyReason::OversizedEntry { .. } => "oversized",
            DenyReason::Uninspectable { .. } => "uninspectable",
        }
    }
}

/// Structural problems that prevent a verdict.
#[derive(Debug, Error, Diagnostic)]
pub enum InspectError {
    #[error("Malformed message: {0}")]
    #[diagnostic(code(gatekeeper::inspect::malformed_message))]
    MalformedMessage(String),

    #[error("Malformed multipart body: {0}")]
    #[diagnostic(code(gatekeeper::inspect::malformed_multipart))]
    MalformedMultipart(String),

    #[error("Malformed encoded word {word:?}: {reason}")]
    #[diagnostic(code(gatekeeper::inspect::encoded_word))]
    EncodedWord { word: String, reason: String },

    #[error("Unsupported charset {0:?}")]
    #[diagnostic(
        code(gatekeeper::inspect::unsupported_charset),
        help("any WHATWG encoding label is accepted")
    )]
    UnsupportedCharset(String),

    #[error("Transfer encoding error: {0}")]
    #[diagnostic(code(gatekeeper::inspect::transfer_encoding))]
    TransferEncoding(String),

    #[error("Malformed {kind} archive: {message}")]
    #[diagnostic(code(gatekeeper::inspect::malformed_archive))]
    MalformedArchive { kind: &'static str, message: String },
}

/// Stops a walk: either a verdict was reached or the input is broken.
#[derive(Debug)]
pub(crate) enum Halt {
    Deny(DenyReason),
    Fail(InspectError),
}

impl From<DenyReason> for Halt {
    fn from(reason: DenyReason) -> Self {
        Halt::Deny(reason)
    }
}

impl From<InspectError> for Halt {
    fn from(err: InspectError) -> Self {
        Halt::Fail(err)
    }
}

/// Reentrant inspection engine. Cloning is cheap; the policy is shared.
#[derive(Debug, Clone)]
pub struct Inspector {
    policy: Arc<ExtensionPolicy>,
    limits: Limits,
}

impl Default for Inspector {
    fn default() -> Self {
        Inspector::new(ExtensionPolicy::default(), Limits::default())
    }
}

impl Inspector {
    pub fn new(policy: ExtensionPolicy, limits: Limits) -> Self {
        Inspector {
            policy: Arc::new(policy),
            limits,
        }
    }

    /// Inspects a full message: header block, blank line, body.
    pub fn inspect(&self, message: &[u8]) -> Result<Verdict, InspectError> {
        let mut walk = Walk::new(self);
        finish(walk.message(message, 0))
    }

    /// Inspects a standalone archive as if it were a top-level attachment.
    #[cfg(test)]
    pub(crate) fn inspect_archive(
        &self,
        filename: &str,
        payload: &[u8],
    ) -> Result<Verdict, InspectError> {
        let mut walk = Walk::new(self);
        finish(walk.archive(filename, payload, 1))
    }
}

fn finish(outcome: Result<(), Halt>) -> Result<Verdict, InspectError> {
    match outcome {
        Ok(()) => Ok(Verdict::Allow),
        Err(Halt::Deny(reason)) => Ok(Verdict::Deny(reason)),
        Err(Halt::Fail(err)) => Err(err),
    }
}

/// Per-call state of one inspection.
struct Walk<'a> {
    policy: &'a ExtensionPolicy,
    limits: &'a Limits,
    /// Bytes of nested archive entries read so far.
    expanded: u64,
}

impl<'a> Walk<'a> {
    fn new(inspector: &'a Inspector) -> Self {
        Walk {
            policy: &inspector.policy,
            limits: &inspector.limits,
            expanded: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::archive::zip::build_zip;
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn multipart(boundary: &str, parts: &[String]) -> Vec<u8> {
        let mut msg = format!(
            "From: a@example.com\r\n\
             To: b@example.com\r\n\
             Subject: test\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\
             \r\n\
             preamble\r\n"
        );
        for part in parts {
            msg.push_str(&format!("--{boundary}\r\n{part}\r\n"));
        }
        msg.push_str(&format!("--{boundary}--\r\n"));
        msg.into_bytes()
    }

    fn message_with(parts: &[String]) -> Vec<u8> {
        multipart("XYZ", parts)
    }

    fn text_part() -> String {
        "Content-Type: text/plain\r\n\r\nHello there".to_string()
    }

    fn attachment(filename: &str, payload: &[u8]) -> String {
        format!(
            "Content-Type: application/octet-stream\r\n\
             Content-Disposition: attachment; filename=\"{filename}\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {}",
            STANDARD.encode(payload)
        )
    }

    fn denied_extension(verdict: Verdict) -> Option<String> {
        match verdict {
            Verdict::Deny(DenyReason::Blacklisted { extension, .. }) => Some(extension),
            _ => None,
        }
    }

    #[test]
    fn test_blacklisted_extension_any_case() {
        let inspector = Inspector::default();
        for name in ["setup.exe", "SETUP.EXE", "Setup.Exe", "run.bat", "x.Scr"] {
            let msg = message_with(&[text_part(), attachment(name, b"MZ")]);
            let verdict = inspector.inspect(&msg).unwrap();
            assert!(
                matches!(verdict, Verdict::Deny(DenyReason::Blacklisted { .. })),
                "{name} should be denied"
            );
        }
    }

    #[test]
    fn test_allowed_attachments() {
        let inspector = Inspector::default();
        for name in ["report.pdf", "photo.JPG", "README", "data.exe.txt"] {
            let msg = message_with(&[text_part(), attachment(name, b"content")]);
            assert_eq!(inspector.inspect(&msg).unwrap(), Verdict::Allow, "{name}");
        }
    }

    #[test]
    fn test_non_multipart_is_allowed() {
        let inspector = Inspector::default();
        let msg = b"From: a@example.com\r\nSubject: hi\r\n\r\nJust text, evil.exe mentioned.\r\n";
        assert_eq!(inspector.inspect(msg).unwrap(), Verdict::Allow);

        // No Content-Type at all is plain text
        let msg = b"Subject: hi\r\n\r\nbody";
        assert_eq!(inspector.inspect(msg).unwrap(), Verdict::Allow);

        // A single-part message is never dispatched, even with a filename
        let msg = b"Content-Type: application/zip; name=\"a.zip\"\r\n\r\nnot a zip";
        assert_eq!(inspector.inspect(msg).unwrap(), Verdict::Allow);
    }

    #[test]
    fn test_zip_with_blacklisted_entry() {
        let inspector = Inspector::default();
        let zip = build_zip(&[("docs/readme.txt", b"hi"), ("payload.scr", b"MZ")]);
        let msg = message_with(&[text_part(), attachment("archive.zip", &zip)]);
        match inspector.inspect(&msg).unwrap() {
            Verdict::Deny(DenyReason::Blacklisted {
                filename,
                extension,
            }) => {
                assert_eq!(filename, "payload.scr");
                assert_eq!(extension, ".scr");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_clean_zip_is_allowed() {
        let inspector = Inspector::default();
        let zip = build_zip(&[("a.txt", b"a"), ("b.pdf", b"b")]);
        let msg = message_with(&[attachment("archive.zip", &zip)]);
        assert_eq!(inspector.inspect(&msg).unwrap(), Verdict::Allow);
    }

    #[test]
    fn test_zip_in_zip() {
        let inspector = Inspector::default();
        let inner = build_zip(&[("deep/tool.vbs", b"x")]);
        let outer = build_zip(&[("notes.txt", b"n"), ("inner.zip", &inner)]);
        let msg = message_with(&[attachment("outer.zip", &outer)]);
        assert_eq!(
            denied_extension(inspector.inspect(&msg).unwrap()),
            Some(".vbs".to_string())
        );
    }

    fn nested_zips(levels: usize) -> Vec<u8> {
        let mut archive = build_zip(&[("clean.txt", b"ok")]);
        for _ in 1..levels {
            archive = build_zip(&[("level.zip", &archive)]);
        }
        archive
    }

    #[test]
    fn test_nesting_cap() {
        let inspector = Inspector::default();

        // Five levels are fine with the default cap
        let msg = message_with(&[attachment("top.zip", &nested_zips(5))]);
        assert_eq!(inspector.inspect(&msg).unwrap(), Verdict::Allow);

        // Six levels are refused even though nothing is blacklisted
        let msg = message_with(&[attachment("top.zip", &nested_zips(6))]);
        assert_eq!(
            inspector.inspect(&msg).unwrap(),
            Verdict::Deny(DenyReason::NestingTooDeep { depth: 6 })
        );

        let strict = Inspector::new(
            ExtensionPolicy::default(),
            Limits {
                max_archive_depth: 1,
                ..Limits::default()
            },
        );
        let msg = message_with(&[attachment("top.zip", &nested_zips(2))]);
        assert!(matches!(
            strict.inspect(&msg).unwrap(),
            Verdict::Deny(DenyReason::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn test_encoded_filename() {
        let inspector = Inspector::default();
        // KOI8-R "счет" + ".exe"
        let koi8 = STANDARD.encode([0xd3, 0xde, 0xc5, 0xd4]);
        let name = format!("=?koi8-r?B?{koi8}?= .exe");
        let msg = message_with(&[attachment(&name, b"MZ")]);
        match inspector.inspect(&msg).unwrap() {
            Verdict::Deny(DenyReason::Blacklisted { filename, .. }) => {
                assert_eq!(filename, "счет.exe")
            }
            other => panic!("unexpected verdict {other:?}"),
        }

        let msg = message_with(&[attachment("=?utf-8?B?aW52b2ljZS5wZGY=?=", b"%PDF")]);
        assert_eq!(inspector.inspect(&msg).unwrap(), Verdict::Allow);
    }

    #[test]
    fn test_undecodable_filename_is_an_error() {
        let inspector = Inspector::default();
        let msg = message_with(&[attachment("=?x-unknown?B?YQ==?=", b"a")]);
        assert!(matches!(
            inspector.inspect(&msg),
            Err(InspectError::UnsupportedCharset(_))
        ));
    }

    #[test]
    fn test_embedded_message() {
        let inspector = Inspector::default();
        let inner = multipart("INNER", &[attachment("inner.cmd", b"echo")]);
        let inner = String::from_utf8(inner).unwrap();
        let part = format!("Content-Type: message/rfc822\r\n\r\n{inner}");
        let msg = message_with(&[text_part(), part]);
        assert_eq!(
            denied_extension(inspector.inspect(&msg).unwrap()),
            Some(".cmd".to_string())
        );
    }

    #[test]
    fn test_same_input_same_verdict() {
        let inspector = Inspector::default();
        let zip = build_zip(&[("x.pif", b"x")]);
        let msg = message_with(&[attachment("a.zip", &zip)]);
        let first = inspector.inspect(&msg).unwrap();
        let second = inspector.inspect(&msg).unwrap();
        assert_eq!(first, second);
        assert!(matches!(first, Verdict::Deny(_)));
    }

    #[test]
    fn test_oversized_nested_entry() {
        let inner = build_zip(&[("big.txt", &[b'a'; 4096][..])]);
        let outer = build_zip(&[("inner.zip", &inner)]);

        let inspector = Inspector::new(
            ExtensionPolicy::default(),
            Limits {
                max_entry_size: 1024,
                ..Limits::default()
            },
        );
        assert_eq!(
            inspector.inspect_archive("outer.zip", &outer).unwrap(),
            Verdict::Deny(DenyReason::OversizedEntry {
                name: "inner.zip".to_string()
            })
        );

        // Each entry fits, but together they exceed the budget
        let outer = build_zip(&[("one.zip", &inner), ("two.zip", &inner)]);
        let budget = inner.len() as u64 + 10;
        let inspector = Inspector::new(
            ExtensionPolicy::default(),
            Limits {
                max_expanded_size: budget,
                ..Limits::default()
            },
        );
        assert_eq!(
            inspector.inspect_archive("outer.zip", &outer).unwrap(),
            Verdict::Deny(DenyReason::OversizedEntry {
                name: "two.zip".to_string()
            })
        );
    }

    #[test]
    fn test_first_deny_wins() {
        let inspector = Inspector::default();
        let msg = message_with(&[
            text_part(),
            attachment("first.exe", b"MZ"),
            attachment("second.bat", b"@echo"),
        ]);
        assert_eq!(
            denied_extension(inspector.inspect(&msg).unwrap()),
            Some(".exe".to_string())
        );
    }

    #[test]
    fn test_deny_reason_text() {
        let reason = DenyReason::Blacklisted {
            filename: "a.exe".to_string(),
            extension: ".exe".to_string(),
        };
        assert_eq!(
            format!("{DENY_CODE} {reason}"),
            "552 Message blocked due to blacklisted attachment"
        );
        assert_eq!(reason.label(), "blacklisted");
    }
}
