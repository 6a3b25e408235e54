use config::{Config, File};
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;

use crate::inspect::{ExtensionPolicy, Limits, DEFAULT_BLACKLIST};

#[derive(Debug, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub server: CfgServer,
    #[serde(default)]
    pub log: CfgLog,
    #[serde(default)]
    pub attachments: CfgAttachments,
    #[serde(default)]
    pub spam: CfgSpam,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Unix,
    Tcp,
}

#[derive(Debug, Deserialize)]
pub struct CfgServer {
    #[serde(default = "default_proto")]
    pub proto: Proto,
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Octal permissions applied to a unix socket.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: String,
    pub metrics_addr: Option<String>,
    pub health_addr: Option<String>,
}

impl Default for CfgServer {
    fn default() -> Self {
        CfgServer {
            proto: default_proto(),
            addr: default_addr(),
            socket_mode: default_socket_mode(),
            metrics_addr: None,
            health_addr: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Fmt,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct CfgLog {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// What to answer when a message cannot be inspected.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Tempfail,
    Accept,
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct CfgAttachments {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub blacklist: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub inspect_tar: bool,
    #[serde(default = "default_true")]
    pub inspect_compressed_tar: bool,
    #[serde(default = "default_archive_depth")]
    pub max_archive_depth: usize,
    #[serde(default = "default_message_depth")]
    pub max_message_depth: usize,
    #[serde(default = "default_entry_size")]
    pub max_entry_size: u64,
    #[serde(default = "default_expanded_size")]
    pub max_expanded_size: u64,
    #[serde(default)]
    pub on_error: OnError,
}

impl Default for CfgAttachments {
    fn default() -> Self {
        CfgAttachments {
            enabled: true,
            blacklist: None,
            inspect_tar: true,
            inspect_compressed_tar: true,
            max_archive_depth: default_archive_depth(),
            max_message_depth: default_message_depth(),
            max_entry_size: default_entry_size(),
            max_expanded_size: default_expanded_size(),
            on_error: OnError::default(),
        }
    }
}

impl CfgAttachments {
    pub fn policy(&self) -> ExtensionPolicy {
        match &self.blacklist {
            Some(list) => ExtensionPolicy::new(list),
            None => ExtensionPolicy::new(DEFAULT_BLACKLIST.iter().copied()),
        }
        .with_tar(self.inspect_tar)
        .with_compressed_tar(self.inspect_compressed_tar)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_archive_depth: self.max_archive_depth,
            max_message_depth: self.max_message_depth,
            max_entry_size: self.max_entry_size,
            max_expanded_size: self.max_expanded_size,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgSpam {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bogofilter")]
    pub bin: String,
    #[serde(default = "default_bogofilter_db")]
    pub db: String,
    /// Quarantine spam that did not arrive from another host.
    #[serde(default)]
    pub local_hold: bool,
}

impl Default for CfgSpam {
    fn default() -> Self {
        CfgSpam {
            enabled: false,
            bin: default_bogofilter(),
            db: default_bogofilter_db(),
            local_hold: false,
        }
    }
}

fn default_proto() -> Proto {
    Proto::Unix
}

fn default_addr() -> String {
    "/var/spool/postfix/milters/gatekeeper.sock".to_string()
}

fn default_socket_mode() -> String {
    "0660".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_archive_depth() -> usize {
    Limits::default().max_archive_depth
}

fn default_message_depth() -> usize {
    Limits::default().max_message_depth
}

fn default_entry_size() -> u64 {
    Limits::default().max_entry_size
}

fn default_expanded_size() -> u64 {
    Limits::default().max_expanded_size
}

fn default_bogofilter() -> String {
    "/usr/bin/bogofilter".to_string()
}

fn default_bogofilter_db() -> String {
    "/var/cache/filter".to_string()
}

impl Cfg {
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read config file {cfg_path}"))?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.attachments.max_archive_depth == 0 {
            return Err(miette!("attachments.max_archive_depth must be at least 1"));
        }
        if self.attachments.max_entry_size > self.attachments.max_expanded_size {
            return Err(miette!(
                "attachments.max_entry_size must not exceed attachments.max_expanded_size"
            ));
        }
        self.socket_mode()?;
        Ok(())
    }

    /// Unix socket permissions parsed from the octal string.
    pub fn socket_mode(&self) -> Result<u32> {
        u32::from_str_radix(self.server.socket_mode.trim_start_matches("0o"), 8)
            .into_diagnostic()
            .wrap_err_with(|| format!("invalid server.socket_mode {:?}", self.server.socket_mode))
    }
}
