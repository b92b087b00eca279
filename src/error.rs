use thiserror::Error;

use std::path::PathBuf;

#[derive(Debug, Error)]
pub enum NetCtrlError {
    #[error("administrator/root privileges are required to change firewall state")]
    PrivilegeDenied,

    #[error("no running process matches '{name}'")]
    TargetNotFound { name: String },

    #[error("command `{command}` failed with {}", exit_code_label(.code))]
    RuleCommandFailed { command: String, code: Option<i32> },

    #[error("no usable network interface found")]
    InterfaceNotFound,

    #[error("{drop_percent}% packet loss is not supported on this platform (only 100% block)")]
    UnsupportedImpairment { drop_percent: f64 },

    #[error("invalid impairment: {reason}")]
    InvalidImpairment { reason: String },

    #[error("target identity {identity} cannot be used by this backend")]
    UnsupportedIdentity { identity: String },

    #[error("failed to spawn command {command}: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "no exit status (terminated by signal)".to_string(),
    }
}
