mod linux;
mod windows;

use std::sync::Arc;

pub use linux::{LinuxNetfilter, LinuxOptions};
pub use windows::WindowsFirewall;

use crate::{
    error::NetCtrlError,
    exec::CommandRunner,
    model::{
        Direction, Impairment, ImpairmentPlan, ImpairmentRecord, RuleRecord, TargetIdentity,
    },
    process::ProcessProbe,
};

/// Platform firewall flavour a backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// Detect the host platform, `None` when neither backend applies
    pub fn current() -> Option<Self> {
        Self::from_os(std::env::consts::OS)
    }

    fn from_os(os: &str) -> Option<Self> {
        match os {
            "linux" => Some(Platform::Linux),
            "windows" => Some(Platform::Windows),
            _ => None,
        }
    }
}

/// Translates traffic policies into platform commands.
///
/// Backends hold no session state: every rule they create is handed back as
/// a record, and retraction is driven purely by those records.
pub trait Backend: Send {
    fn platform(&self) -> Platform;

    /// Idempotent one-time setup, run once at startup before any session
    fn ensure_base_chains(&self) -> Result<(), NetCtrlError>;

    /// Resolve a process name to the identity rules are scoped to
    fn resolve(&self, name: &str) -> Result<TargetIdentity, NetCtrlError>;

    /// Install one blocking rule; the record exists only if creation succeeded
    fn apply_direction(
        &self,
        identity: &TargetIdentity,
        direction: Direction,
    ) -> Result<RuleRecord, NetCtrlError>;

    /// Remove one previously created rule (best effort)
    fn retract_rule(&self, record: &RuleRecord);

    /// Default outbound interface, where the platform shapes per interface
    fn find_interface(&self) -> Option<String>;

    /// Decide how an impairment would be installed without changing
    /// anything; unsupported requests and missing interfaces fail here
    fn plan_impairment(&self, impairment: Impairment) -> Result<ImpairmentPlan, NetCtrlError>;

    /// Remove `prior`, if any, then install `plan`.
    ///
    /// `prior` is gone once this returns, whether or not the new rules could
    /// be installed. A failed installation leaves nothing of itself behind.
    fn apply_impairment(
        &self,
        plan: &ImpairmentPlan,
        prior: Option<&ImpairmentRecord>,
    ) -> Result<ImpairmentRecord, NetCtrlError>;

    /// Remove an impairment (best effort)
    fn clear_impairment(&self, record: &ImpairmentRecord);
}

/// Names and fallbacks the backends are parameterized with
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOptions {
    pub rule_name: String,
    pub linux: LinuxOptions,
}

/// Build the backend for a platform
pub fn backend_for(
    platform: Platform,
    options: &BackendOptions,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ProcessProbe>,
) -> Box<dyn Backend> {
    match platform {
        Platform::Linux => Box::new(LinuxNetfilter::new(options.linux.clone(), runner, probe)),
        Platform::Windows => Box::new(WindowsFirewall::new(&options.rule_name, runner, probe)),
    }
}
