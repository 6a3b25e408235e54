use ::zip::{result::ZipError, ZipArchive};
use std::io::{Cursor, Read, Seek};

use super::{read_bounded, EntryContents, EntryError, Visitor};
use crate::inspect::{ContainerKind, Halt, InspectError};

/// Lists entry names from the central directory. Entry data is only
/// decompressed when the visitor asks for it.
pub(super) fn list_entries(payload: &[u8], visit: &mut Visitor<'_>) -> Result<(), Halt> {
    let mut archive = ZipArchive::new(Cursor::new(payload)).map_err(malformed)?;
    for index in 0..archive.len() {
        let name = archive
            .by_index_raw(index)
            .map_err(malformed)?
            .name()
            .to_string();
        visit(
            &name,
            &mut LazyEntry {
                archive: &mut archive,
                index,
            },
        )?;
    }
    Ok(())
}

struct LazyEntry<'a, R> {
    archive: &'a mut ZipArchive<R>,
    index: usize,
}

impl<R: Read + Seek> EntryContents for LazyEntry<'_, R> {
    fn read_contents(&mut self, limit: u64) -> Result<Vec<u8>, EntryError> {
        let file = self.archive.by_index(self.index).map_err(|e| match e {
            ZipError::UnsupportedArchive(ZipError::PASSWORD_REQUIRED) => {
                EntryError::Unreadable(ZipError::PASSWORD_REQUIRED.to_string())
            }
            ZipError::UnsupportedArchive(reason) => EntryError::Sealed(reason),
            other => EntryError::Unreadable(other.to_string()),
        })?;
        read_bounded(file, limit)
    }
}

fn malformed(err: ZipError) -> InspectError {
    InspectError::MalformedArchive {
        kind: ContainerKind::Zip.name(),
        message: err.to_string(),
    }
}

/// Builds an uncompressed zip for tests.
#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    build_zip_with(entries, ::zip::CompressionMethod::Stored)
}

#[cfg(test)]
pub(crate) fn build_zip_with(entries: &[(&str, &[u8])], method: ::zip::CompressionMethod) -> Vec<u8> {
    use ::zip::write::SimpleFileOptions;
    use std::io::Write;

    let mut writer = ::zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{DenyReason, Inspector, Verdict};

    #[test]
    fn test_deflated_entries() {
        let inner = build_zip_with(
            &[("a.txt", b"aaaaaaaaaaaaaaaaaaaa"), ("b.hta", b"<html>")],
            ::zip::CompressionMethod::Deflated,
        );
        let outer = build_zip_with(
            &[("nested/inner.ZIP", &inner)],
            ::zip::CompressionMethod::Deflated,
        );
        let verdict = Inspector::default()
            .inspect_archive("outer.zip", &outer)
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::Deny(DenyReason::Blacklisted {
                filename: "b.hta".to_string(),
                extension: ".hta".to_string(),
            })
        );
    }

    #[test]
    fn test_stops_at_first_denied_entry() {
        let zip = build_zip(&[("one.lnk", b""), ("two.reg", b"")]);
        let mut seen = Vec::new();
        let outcome = list_entries(&zip, &mut |name: &str, _: &mut dyn EntryContents| {
            seen.push(name.to_string());
            Err(Halt::Deny(DenyReason::NestingTooDeep { depth: 0 }))
        });
        assert!(matches!(outcome, Err(Halt::Deny(_))));
        assert_eq!(seen, vec!["one.lnk"]);
    }

    #[test]
    fn test_nested_zip_codecs() {
        let inner = build_zip(&[("invoice.exe", b"MZ")]);
        for method in [
            ::zip::CompressionMethod::Bzip2,
            ::zip::CompressionMethod::Zstd,
        ] {
            let outer = build_zip_with(&[("docs.zip", &inner)], method);
            assert_eq!(
                Inspector::default()
                    .inspect_archive("mail.zip", &outer)
                    .unwrap(),
                Verdict::Deny(DenyReason::Blacklisted {
                    filename: "invoice.exe".to_string(),
                    extension: ".exe".to_string(),
                }),
                "{method:?}"
            );
        }
    }

    #[test]
    fn test_nested_zip_unsupported_method() {
        let inner = build_zip(&[("invoice.exe", b"MZ")]);
        let mut outer = build_zip(&[("docs.zip", &inner)]);
        let central = memchr::memmem::rfind(&outer, b"PK\x01\x02").unwrap();
        // Method 98 (PPMd) in the local and central headers
        outer[8..10].copy_from_slice(&98u16.to_le_bytes());
        outer[central + 10..central + 12].copy_from_slice(&98u16.to_le_bytes());

        assert!(matches!(
            Inspector::default()
                .inspect_archive("mail.zip", &outer)
                .unwrap(),
            Verdict::Deny(DenyReason::Uninspectable { name, .. }) if name == "docs.zip"
        ));
    }

    #[test]
    fn test_password_protected_nested_zip_is_skipped() {
        let inner = build_zip(&[("invoice.exe", b"MZ")]);
        let mut outer = build_zip(&[("docs.zip", &inner)]);
        let central = memchr::memmem::rfind(&outer, b"PK\x01\x02").unwrap();
        // Encryption bit in the local and central headers
        outer[6] |= 0x01;
        outer[central + 8] |= 0x01;

        assert_eq!(
            Inspector::default()
                .inspect_archive("mail.zip", &outer)
                .unwrap(),
            Verdict::Allow
        );
    }

    #[test]
    fn test_malformed_zip() {
        let inspector = Inspector::default();
        assert!(matches!(
            inspector.inspect_archive("a.zip", b"PK\x03\x04 truncated"),
            Err(InspectError::MalformedArchive { kind: "zip", .. })
        ));
        assert!(matches!(
            inspector.inspect_archive("a.zip", b""),
            Err(InspectError::MalformedArchive { .. })
        ));
    }

    #[test]
    fn test_empty_zip() {
        let zip = build_zip(&[]);
        assert_eq!(
            Inspector::default().inspect_archive("a.zip", &zip).unwrap(),
            Verdict::Allow
        );
    }
}
