use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::NetCtrlError;

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub linux: LinuxConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct RulesConfig {
    /// Base name for Windows Firewall rules (`<name>_out`, `<name>_in`)
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct LinuxConfig {
    /// iptables chain holding outbound DROP rules
    pub out_chain: Option<String>,
    /// iptables chain holding inbound DROP rules
    pub in_chain: Option<String>,
    /// Interfaces probed when the routing table has no default route
    pub interfaces: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ShellConfig {
    /// Process targeted when none is given on the command line
    pub target: Option<String>,
    /// Wait for impairment rules before reporting success
    pub confirm_impairment: Option<bool>,
}

impl ConfigFile {
    /// Load configuration file
    pub fn load(path: &Path) -> Result<Self, NetCtrlError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| NetCtrlError::ConfigParse {
            path: PathBuf::from(path),
            source,
        })
    }
}
