use std::collections::HashSet;

/// Extensions refused anywhere in a message, including inside archives.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    ".asd", ".bat", ".chm", ".cmd", ".com", ".cpl", ".dll", ".do", ".exe", ".hlp", ".hta", ".js",
    ".jse", ".lnk", ".msi", ".ocx", ".pif", ".ps1", ".reg", ".scr", ".shb", ".shm", ".shs", ".vbe",
    ".vbs", ".vbx", ".vxd", ".wsf", ".wsh", ".xl",
];

/// Archive formats whose entries can be listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Rar,
    Tar,
    TarGz,
}

impl ContainerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerKind::Zip => "zip",
            ContainerKind::Rar => "rar",
            ContainerKind::Tar => "tar",
            ContainerKind::TarGz => "tar.gz",
        }
    }
}

/// Longest suffixes first so `.tar.gz` wins over a plain `.gz` match.
const CONTAINER_SUFFIXES: &[(&str, ContainerKind)] = &[
    (".tar.gz", ContainerKind::TarGz),
    (".tgz", ContainerKind::TarGz),
    (".tar", ContainerKind::Tar),
    (".zip", ContainerKind::Zip),
    (".rar", ContainerKind::Rar),
];

#[derive(Debug, Clone)]
pub struct ExtensionPolicy {
    blacklist: HashSet<String>,
    tar: bool,
    compressed_tar: bool,
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST.iter().copied())
    }
}

impl ExtensionPolicy {
    /// Entries are normalized to lower case with a leading dot.
    pub fn new<I, S>(blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blacklist = blacklist
            .into_iter()
            .filter_map(|ext| {
                let ext = ext.as_ref().trim().to_lowercase();
                match ext.as_str() {
                    "" | "." => None,
                    _ if ext.starts_with('.') => Some(ext),
                    _ => Some(format!(".{ext}")),
                }
            })
            .collect();

        ExtensionPolicy {
            blacklist,
            tar: true,
            compressed_tar: true,
        }
    }

    pub fn with_tar(mut self, enabled: bool) -> Self {
        self.tar = enabled;
        self
    }

    pub fn with_compressed_tar(mut self, enabled: bool) -> Self {
        self.compressed_tar = enabled;
        self
    }

    /// `extension` is the output of [`extension_of`].
    pub fn is_allowed(&self, extension: &str) -> bool {
        !self.blacklist.contains(extension)
    }

    pub fn is_container(&self, name: &str) -> bool {
        self.container_kind(name).is_some()
    }

    pub fn container_kind(&self, name: &str) -> Option<ContainerKind> {
        let name = final_component(name).to_lowercase();
        let name = name.trim_end_matches(['.', ' ']);
        let (_, kind) = CONTAINER_SUFFIXES
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix))?;
        match kind {
            ContainerKind::Tar if !self.tar => None,
            ContainerKind::TarGz if !self.compressed_tar => None,
            kind => Some(*kind),
        }
    }
}

/// Lower-cased, dot-prefixed suffix of the last path element, or empty.
///
/// Trailing dots and spaces are dropped first: Windows ignores them, so
/// `evil.exe.` still runs as an executable.
pub fn extension_of(name: &str) -> String {
    let file = final_component(name).trim_end_matches(['.', ' ']);
    match file.rfind('.') {
        Some(idx) => file[idx..].to_lowercase(),
        None => String::new(),
    }
}

fn final_component(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
