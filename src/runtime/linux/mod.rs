mod cgroup;
mod interface;

use std::sync::Arc;

use crate::{
    error::NetCtrlError,
    exec::{CommandLine, CommandRunner, run_best_effort, run_checked},
    model::{
        Direction, Impairment, ImpairmentPlan, ImpairmentRecord, ImpairmentRule, RuleRecord,
        RuleTarget, TargetIdentity,
    },
    process::ProcessProbe,
};

use super::{Backend, Platform};

pub use interface::DEFAULT_FALLBACK_INTERFACES;

/// Chain names and interface fallbacks used by the netfilter backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxOptions {
    pub out_chain: String,
    pub in_chain: String,
    pub fallback_interfaces: Vec<String>,
}

impl Default for LinuxOptions {
    fn default() -> Self {
        Self {
            out_chain: "NETCTRL_OUT".to_string(),
            in_chain: "NETCTRL_IN".to_string(),
            fallback_interfaces: DEFAULT_FALLBACK_INTERFACES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

/// iptables chains for per-process blocking, `tc netem` for host-wide impairment
pub struct LinuxNetfilter {
    options: LinuxOptions,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ProcessProbe>,
}

fn iptables() -> CommandLine {
    CommandLine::new("iptables").arg("-w")
}

fn base_chain(direction: Direction) -> &'static str {
    match direction {
        Direction::Outbound => "OUTPUT",
        Direction::Inbound => "INPUT",
    }
}

fn cgroup_match(path: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "cgroup".to_string(),
        "--path".to_string(),
        path.to_string(),
    ]
}

fn pid_match(pid: u32) -> Vec<String> {
    vec![
        "-m".to_string(),
        "owner".to_string(),
        "--pid-owner".to_string(),
        pid.to_string(),
    ]
}

/// `iptables -w <-A|-D> <chain> <match...> -j DROP`
fn drop_rule(action: &str, chain: &str, matcher: Vec<String>) -> CommandLine {
    iptables()
        .args([action, chain])
        .args(matcher)
        .args(["-j", "DROP"])
}

/// `delay <lag>ms loss <drop>%`, omitting zero terms (but never both)
fn netem_args(impairment: &Impairment) -> Vec<String> {
    let mut args = Vec::new();
    if impairment.lag_ms() > 0 {
        args.push("delay".to_string());
        args.push(format!("{}ms", impairment.lag_ms()));
    }
    if impairment.drop_percent() > 0.0 {
        args.push("loss".to_string());
        args.push(format!("{:.2}%", impairment.drop_percent()));
    }
    if args.is_empty() {
        args.push("delay".to_string());
        args.push("0ms".to_string());
    }
    args
}

impl LinuxNetfilter {
    pub fn new(
        options: LinuxOptions,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            options,
            runner,
            probe,
        }
    }

    fn chain(&self, direction: Direction) -> &str {
        match direction {
            Direction::Outbound => &self.options.out_chain,
            Direction::Inbound => &self.options.in_chain,
        }
    }

    fn delete_qdisc(&self, interface: &str) {
        let command = CommandLine::new("tc").args(["qdisc", "del", "dev", interface, "root"]);
        run_best_effort(self.runner.as_ref(), &command);
    }

    /// Catch-all DROP in a base chain, tagged with our chain name so that
    /// `-D` can only ever match the rule we inserted
    fn base_drop(&self, direction: Direction, action: &[&str]) -> CommandLine {
        iptables()
            .args(action.iter().copied())
            .args(["-m", "comment", "--comment", self.chain(direction)])
            .args(["-j", "DROP"])
    }

    fn remove_impairment_rule(&self, rule: &ImpairmentRule) {
        match rule {
            ImpairmentRule::Qdisc { interface } => {
                self.delete_qdisc(interface);
                log::info!("removed netem from {interface}");
            }
            ImpairmentRule::BaseChainDrop(direction) => {
                let base = base_chain(*direction);
                run_best_effort(self.runner.as_ref(), &self.base_drop(*direction, &["-D", base]));
                log::info!("removed unconditional DROP from {base}");
            }
            ImpairmentRule::FirewallRule(_) => {
                log::warn!("netfilter backend cannot remove {rule:?}")
            }
        }
    }

    /// Remove every rule of `prior` except a qdisc on `keep_interface`,
    /// which the caller replaces itself
    fn clear_prior(&self, prior: Option<&ImpairmentRecord>, keep_interface: Option<&str>) {
        let Some(prior) = prior else {
            return;
        };
        for rule in prior.rules() {
            match rule {
                ImpairmentRule::Qdisc { interface } if Some(interface.as_str()) == keep_interface => {}
                other => self.remove_impairment_rule(other),
            }
        }
    }

    fn apply_block(&self, impairment: Impairment) -> Result<ImpairmentRecord, NetCtrlError> {
        let mut record = ImpairmentRecord::new(impairment);
        for direction in [Direction::Inbound, Direction::Outbound] {
            let command = self.base_drop(direction, &["-I", base_chain(direction), "1"]);
            match self.runner.dispatch(&command) {
                Ok(handle) => record.push_dispatched(ImpairmentRule::BaseChainDrop(direction), handle),
                Err(err) => {
                    // Undo whatever of this impairment did get installed.
                    let _ = record.settle();
                    self.clear_impairment(&record);
                    return Err(err);
                }
            }
        }
        log::info!("dispatched unconditional DROP at the head of INPUT and OUTPUT");
        Ok(record)
    }

    fn apply_netem(
        &self,
        impairment: Impairment,
        interface: &str,
    ) -> Result<ImpairmentRecord, NetCtrlError> {
        // At most one root qdisc may exist per interface; this also removes
        // whatever a previous run left behind.
        self.delete_qdisc(interface);

        let command = CommandLine::new("tc")
            .args(["qdisc", "add", "dev", interface, "root", "netem"])
            .args(netem_args(&impairment));
        let handle = self.runner.dispatch(&command)?;
        log::info!("dispatched netem ({impairment}) on {interface}");

        let mut record = ImpairmentRecord::new(impairment);
        record.push_dispatched(
            ImpairmentRule::Qdisc {
                interface: interface.to_string(),
            },
            handle,
        );
        Ok(record)
    }

    /// Insert `base -j chain` unless the jump is already there
    fn link_chain(&self, base: &str, chain: &str) -> Result<(), NetCtrlError> {
        let check = iptables().args(["-C", base, "-j", chain]);
        if self.runner.status(&check)? == Some(0) {
            log::debug!("{base} already jumps to {chain}");
            return Ok(());
        }
        run_checked(
            self.runner.as_ref(),
            &iptables().args(["-I", base, "-j", chain]),
        )?;
        log::info!("linked {base} -> {chain}");
        Ok(())
    }
}

impl Backend for LinuxNetfilter {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn ensure_base_chains(&self) -> Result<(), NetCtrlError> {
        for direction in [Direction::Outbound, Direction::Inbound] {
            // -N fails when the chain already exists, which is fine.
            run_best_effort(
                self.runner.as_ref(),
                &iptables().args(["-N", self.chain(direction)]),
            );
        }
        for direction in [Direction::Outbound, Direction::Inbound] {
            self.link_chain(base_chain(direction), self.chain(direction))?;
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<TargetIdentity, NetCtrlError> {
        let pid = self
            .probe
            .find_pid_by_exact_name(name)
            .ok_or_else(|| NetCtrlError::TargetNotFound {
                name: name.to_string(),
            })?;

        let identity = match self.probe.read_cgroup(pid) {
            Ok(contents) => match cgroup::sandbox_cgroup_path(&contents) {
                Some(path) => TargetIdentity::CgroupPath(path),
                None => TargetIdentity::PidOwner(pid),
            },
            Err(err) => {
                log::debug!("cannot read cgroup of pid {pid}: {err}");
                TargetIdentity::PidOwner(pid)
            }
        };
        log::info!("resolved '{name}' to {identity}");
        Ok(identity)
    }

    fn apply_direction(
        &self,
        identity: &TargetIdentity,
        direction: Direction,
    ) -> Result<RuleRecord, NetCtrlError> {
        let chain = self.chain(direction).to_string();
        let (target, matcher) = match identity {
            TargetIdentity::CgroupPath(path) => (
                RuleTarget::Cgroup {
                    chain: chain.clone(),
                    path: path.clone(),
                },
                cgroup_match(path),
            ),
            TargetIdentity::PidOwner(pid) => (
                RuleTarget::PidOwner {
                    chain: chain.clone(),
                    pid: *pid,
                },
                pid_match(*pid),
            ),
            TargetIdentity::ExecutablePath(_) => {
                return Err(NetCtrlError::UnsupportedIdentity {
                    identity: identity.to_string(),
                });
            }
        };

        run_checked(self.runner.as_ref(), &drop_rule("-A", &chain, matcher))?;
        log::info!("appended DROP for {identity} to {chain}");

        Ok(RuleRecord::new(direction, target))
    }

    fn retract_rule(&self, record: &RuleRecord) {
        let (chain, matcher) = match &record.target {
            RuleTarget::Cgroup { chain, path } => (chain, cgroup_match(path)),
            RuleTarget::PidOwner { chain, pid } => (chain, pid_match(*pid)),
            RuleTarget::FirewallRule(_) => {
                log::warn!("netfilter backend cannot remove {:?}", record.target);
                return;
            }
        };
        run_best_effort(self.runner.as_ref(), &drop_rule("-D", chain, matcher));
        log::info!("removed {} DROP rule from {chain}", record.direction);
    }

    fn find_interface(&self) -> Option<String> {
        interface::select_interface(
            self.runner.as_ref(),
            self.probe.as_ref(),
            &self.options.fallback_interfaces,
        )
    }

    fn plan_impairment(&self, impairment: Impairment) -> Result<ImpairmentPlan, NetCtrlError> {
        if impairment.is_pure_drop() {
            return Ok(ImpairmentPlan::Block(impairment));
        }
        let interface = self.find_interface().ok_or(NetCtrlError::InterfaceNotFound)?;
        Ok(ImpairmentPlan::Shape {
            impairment,
            interface,
        })
    }

    fn apply_impairment(
        &self,
        plan: &ImpairmentPlan,
        prior: Option<&ImpairmentRecord>,
    ) -> Result<ImpairmentRecord, NetCtrlError> {
        match plan {
            ImpairmentPlan::Block(impairment) => {
                self.clear_prior(prior, None);
                self.apply_block(*impairment)
            }
            ImpairmentPlan::Shape {
                impairment,
                interface,
            } => {
                self.clear_prior(prior, Some(interface.as_str()));
                self.apply_netem(*impairment, interface)
            }
        }
    }

    fn clear_impairment(&self, record: &ImpairmentRecord) {
        for rule in record.rules() {
            self.remove_impairment_rule(rule);
        }
    }
}
