use std::io::Read;

use super::{Streamed, Visitor};
use crate::inspect::{ContainerKind, Halt, InspectError};

/// Streams through tar headers. The current entry's data is consumed or
/// skipped before the next header is read, so nested archives have to be
/// read while they are being visited.
pub(super) fn list_entries<R: Read>(
    reader: R,
    kind: ContainerKind,
    visit: &mut Visitor<'_>,
) -> Result<(), Halt> {
    let malformed = |err: std::io::Error| InspectError::MalformedArchive {
        kind: kind.name(),
        message: err.to_string(),
    };

    let mut archive = ::tar::Archive::new(reader);
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        visit(&name, &mut Streamed(&mut entry))?;
    }
    Ok(())
}

/// Builds a ustar archive for tests.
#[cfg(test)]
pub(crate) fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = ::tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = ::tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}
