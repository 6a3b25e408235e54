//! Archive listing and the recursion into nested archives.

use flate2::read::GzDecoder;
use std::io::Read;
use tracing::debug;

use super::policy::{extension_of, ContainerKind};
use super::{DenyReason, Halt, Walk};

mod rar;
mod tar;
pub(crate) mod zip;

/// On-demand access to the bytes of one archive entry.
pub trait EntryContents {
    /// Reads the entry, refusing anything longer than `limit` bytes.
    fn read_contents(&mut self, limit: u64) -> Result<Vec<u8>, EntryError>;
}

/// Why the bytes of a single entry are not available. Never fatal for the
/// archive as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    /// Corrupt or encrypted data, skipped.
    Unreadable(String),
    /// Packed with a method this build cannot unpack.
    Sealed(&'static str),
    TooLarge,
}

/// Called once per entry, in archive order. An error stops the listing.
pub(crate) type Visitor<'v> = dyn FnMut(&str, &mut dyn EntryContents) -> Result<(), Halt> + 'v;

/// Streaming entry of a reader-based format.
pub(crate) struct Streamed<R>(pub R);

impl<R: Read> EntryContents for Streamed<R> {
    fn read_contents(&mut self, limit: u64) -> Result<Vec<u8>, EntryError> {
        read_bounded(&mut self.0, limit)
    }
}

pub(crate) fn read_bounded<R: Read>(reader: R, limit: u64) -> Result<Vec<u8>, EntryError> {
    let mut buf = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| EntryError::Unreadable(e.to_string()))?;
    if buf.len() as u64 > limit {
        return Err(EntryError::TooLarge);
    }
    Ok(buf)
}

impl Walk<'_> {
    /// Lists `payload` as the archive named `filename`, which sits at nesting
    /// level `depth`. Names that are not archives are ignored.
    pub(super) fn archive(&mut self, filename: &str, payload: &[u8], depth: usize) -> Result<(), Halt> {
        let Some(kind) = self.policy.container_kind(filename) else {
            return Ok(());
        };
        if depth > self.limits.max_archive_depth {
            debug!(filename, depth, "archive nesting limit reached");
            return Err(DenyReason::NestingTooDeep { depth }.into());
        }
        debug!(filename, kind = kind.name(), depth, size = payload.len(), "listing archive");

        let mut visit = |name: &str, entry: &mut dyn EntryContents| self.entry(name, entry, depth);
        match kind {
            ContainerKind::Zip => zip::list_entries(payload, &mut visit),
            ContainerKind::Rar => rar::list_entries(payload, &mut visit),
            ContainerKind::Tar => tar::list_entries(payload, kind, &mut visit),
            ContainerKind::TarGz => tar::list_entries(GzDecoder::new(payload), kind, &mut visit),
        }
    }

    fn entry(&mut self, name: &str, entry: &mut dyn EntryContents, depth: usize) -> Result<(), Halt> {
        let extension = extension_of(name);
        if !self.policy.is_allowed(&extension) {
            debug!(entry = name, %extension, depth, "blacklisted archive entry");
            return Err(DenyReason::Blacklisted {
                filename: name.to_string(),
                extension,
            }
            .into());
        }
        if !self.policy.is_container(name) {
            return Ok(());
        }

        let budget = self.limits.max_expanded_size.saturating_sub(self.expanded);
        match entry.read_contents(self.limits.max_entry_size.min(budget)) {
            Ok(contents) => {
                self.expanded += contents.len() as u64;
                self.archive(name, &contents, depth + 1)
            }
            Err(EntryError::TooLarge) => Err(DenyReason::OversizedEntry {
                name: name.to_string(),
            }
            .into()),
            Err(EntryError::Sealed(reason)) => {
                debug!(entry = name, reason, depth, "nested archive cannot be unpacked");
                Err(DenyReason::Uninspectable {
                    name: name.to_string(),
                    reason: reason.to_string(),
                }
                .into())
            }
            Err(EntryError::Unreadable(reason)) => {
                debug!(entry = name, %reason, "skipping unreadable nested archive");
                Ok(())
            }
        }
    }
}
