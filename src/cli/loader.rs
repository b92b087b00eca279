use crate::error::NetCtrlError;
use crate::runtime::{BackendOptions, LinuxOptions};

use super::args::Args;
use super::config::ConfigFile;

/// Process targeted when neither the command line nor the config names one
pub const DEFAULT_TARGET: &str = "sober";

/// Base name of the rules this tool creates
pub const DEFAULT_RULE_NAME: &str = "netctrl";

/// Effective settings after merging the config file and CLI flags
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub target: String,
    pub backend: BackendOptions,
    pub confirm_impairment: bool,
    pub dry_run: bool,
}

/// Merge settings from command line arguments and config file
pub struct SettingsLoader;

impl SettingsLoader {
    /// Load settings; command line flags win over the config file
    pub fn load(args: &Args) -> Result<Settings, NetCtrlError> {
        let config = match args.config.as_ref() {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Ok(Self::merge(args, config))
    }

    fn merge(args: &Args, config: ConfigFile) -> Settings {
        let defaults = LinuxOptions::default();
        let linux = LinuxOptions {
            out_chain: config.linux.out_chain.unwrap_or(defaults.out_chain),
            in_chain: config.linux.in_chain.unwrap_or(defaults.in_chain),
            fallback_interfaces: config
                .linux
                .interfaces
                .unwrap_or(defaults.fallback_interfaces),
        };

        let rule_name = args
            .rule_name
            .clone()
            .or(config.rules.name)
            .unwrap_or_else(|| DEFAULT_RULE_NAME.to_string());

        let target = args
            .target
            .clone()
            .or(config.shell.target)
            .unwrap_or_else(|| DEFAULT_TARGET.to_string());

        Settings {
            target,
            backend: BackendOptions { rule_name, linux },
            confirm_impairment: args.confirm || config.shell.confirm_impairment.unwrap_or(false),
            dry_run: args.dry_run,
        }
    }
}
