use std::{fmt, path::PathBuf};

use crate::{error::NetCtrlError, exec::PendingCommand};

/// Traffic direction relative to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    /// Short form used by netsh (`dir=out`) and rule-name suffixes
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outbound => "out",
            Direction::Inbound => "in",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Platform handle a blocking session is locked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetIdentity {
    /// Full image path of the process (Windows)
    ExecutablePath(PathBuf),
    /// Process id matched with the iptables owner module (Linux)
    PidOwner(u32),
    /// Control-group path of a sandboxed launch such as flatpak (Linux)
    CgroupPath(String),
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetIdentity::ExecutablePath(path) => write!(f, "executable {}", path.display()),
            TargetIdentity::PidOwner(pid) => write!(f, "pid {pid}"),
            TargetIdentity::CgroupPath(path) => write!(f, "cgroup {path}"),
        }
    }
}

/// What a single created rule matches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    /// netsh rule addressed by its (direction-suffixed) name
    FirewallRule(String),
    /// iptables `-m cgroup --path` rule in a direction chain
    Cgroup { chain: String, path: String },
    /// iptables `-m owner --pid-owner` rule in a direction chain
    PidOwner { chain: String, pid: u32 },
}

/// Bookkeeping entry for one platform rule this session created.
///
/// Only ever built after the creation command reported success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub direction: Direction,
    pub target: RuleTarget,
}

impl RuleRecord {
    pub fn new(direction: Direction, target: RuleTarget) -> Self {
        Self { direction, target }
    }
}

/// Host-wide latency and loss request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impairment {
    lag_ms: u32,
    drop_percent: f64,
}

impl Impairment {
    pub fn new(lag_ms: u32, drop_percent: f64) -> Result<Self, NetCtrlError> {
        if !drop_percent.is_finite() {
            return Err(NetCtrlError::InvalidImpairment {
                reason: format!("drop percentage {drop_percent} is not a number"),
            });
        }
        if !(0.0..=100.0).contains(&drop_percent) {
            return Err(NetCtrlError::InvalidImpairment {
                reason: format!("drop percentage {drop_percent} is outside 0..=100"),
            });
        }
        Ok(Self {
            lag_ms,
            drop_percent,
        })
    }

    /// Block everything: 100% loss
    pub fn full_block() -> Self {
        Self {
            lag_ms: 0,
            drop_percent: 100.0,
        }
    }

    pub fn lag_ms(&self) -> u32 {
        self.lag_ms
    }

    pub fn drop_percent(&self) -> f64 {
        self.drop_percent
    }

    pub fn is_total_loss(&self) -> bool {
        self.drop_percent >= 100.0
    }

    /// 100% loss with no added latency can be expressed as a plain DROP rule
    pub fn is_pure_drop(&self) -> bool {
        self.is_total_loss() && self.lag_ms == 0
    }
}

impl fmt::Display for Impairment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms + {}% drop", self.lag_ms, self.drop_percent)
    }
}

/// What the backend will install for an impairment, decided before any
/// existing configuration is touched
#[derive(Debug, Clone, PartialEq)]
pub enum ImpairmentPlan {
    /// Drop everything in both directions
    Block(Impairment),
    /// netem shaping on one interface
    Shape {
        impairment: Impairment,
        interface: String,
    },
}

impl ImpairmentPlan {
    pub fn impairment(&self) -> Impairment {
        match self {
            ImpairmentPlan::Block(impairment) => *impairment,
            ImpairmentPlan::Shape { impairment, .. } => *impairment,
        }
    }
}

/// One host-wide rule an impairment consists of
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpairmentRule {
    /// netsh block-any rule, by name
    FirewallRule(String),
    /// Tagged DROP at the head of INPUT or OUTPUT
    BaseChainDrop(Direction),
    /// netem root qdisc on an interface
    Qdisc { interface: String },
}

#[derive(Debug)]
struct Install {
    rule: ImpairmentRule,
    pending: Option<PendingCommand>,
}

/// Record of the currently active impairment.
///
/// Holds one entry per rule whose installation was started. Rules still
/// pending are dropped from the record by [`settle`] if their command fails,
/// so removal only ever targets rules that exist.
///
/// [`settle`]: ImpairmentRecord::settle
#[derive(Debug)]
pub struct ImpairmentRecord {
    pub impairment: Impairment,
    installs: Vec<Install>,
}

impl ImpairmentRecord {
    pub fn new(impairment: Impairment) -> Self {
        Self {
            impairment,
            installs: Vec::new(),
        }
    }

    /// Add a rule whose installation is known to have succeeded
    pub fn with_rule(mut self, rule: ImpairmentRule) -> Self {
        self.installs.push(Install {
            rule,
            pending: None,
        });
        self
    }

    /// Add a rule whose installation command is still running
    pub fn push_dispatched(&mut self, rule: ImpairmentRule, pending: PendingCommand) {
        self.installs.push(Install {
            rule,
            pending: Some(pending),
        });
    }

    pub fn rules(&self) -> impl Iterator<Item = &ImpairmentRule> {
        self.installs.iter().map(|install| &install.rule)
    }

    /// Wait for every outstanding installation and forget the rules whose
    /// command failed. Returns the first failure.
    pub fn settle(&mut self) -> Result<(), NetCtrlError> {
        let mut first_error = None;
        self.installs.retain_mut(|install| {
            let Some(pending) = install.pending.take() else {
                return true;
            };
            match pending.wait() {
                Ok(()) => true,
                Err(err) => {
                    log::debug!("{:?} was not installed: {err}", install.rule);
                    first_error.get_or_insert(err);
                    false
                }
            }
        });
        first_error.map_or(Ok(()), Err)
    }
}

/// Coarse lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unblocked,
    PartiallyBlocked,
    FullyBlocked,
}

/// Result of a block request that passed the session's flag check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Installed,
    AlreadyActive,
}
