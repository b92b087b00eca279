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

/// Windows Firewall rules managed through `netsh advfirewall`
pub struct WindowsFirewall {
    rule_name: String,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ProcessProbe>,
}

impl WindowsFirewall {
    pub fn new(
        rule_name: &str,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            runner,
            probe,
        }
    }

    fn direction_rule_name(&self, direction: Direction) -> String {
        format!("{}_{}", self.rule_name, direction.as_str())
    }

    fn lag_rule_name(&self, direction: Direction) -> String {
        format!("{}_lag_{}", self.rule_name, direction.as_str())
    }

    fn delete_rule(&self, name: &str) {
        let command = netsh()
            .args(["delete", "rule"])
            .arg(format!("name={name}"));
        run_best_effort(self.runner.as_ref(), &command);
        log::info!("removed firewall rule {name}");
    }
}

fn netsh() -> CommandLine {
    CommandLine::new("netsh").args(["advfirewall", "firewall"])
}

/// `netsh advfirewall firewall add rule ...` blocking one direction
fn add_block_rule(name: &str, direction: Direction, program: Option<&str>) -> CommandLine {
    let mut command = netsh()
        .args(["add", "rule"])
        .arg(format!("name={name}"))
        .arg(format!("dir={}", direction.as_str()))
        .arg("action=block");
    if let Some(program) = program {
        command = command.arg(format!("program={program}"));
    }
    command.args(["protocol=any", "enable=yes"])
}

impl Backend for WindowsFirewall {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn ensure_base_chains(&self) -> Result<(), NetCtrlError> {
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<TargetIdentity, NetCtrlError> {
        // Substring match in enumeration order; a match whose image path
        // cannot be queried (access denied, exited) is skipped.
        for entry in self.probe.list_processes() {
            if !entry.name.contains(name) {
                continue;
            }
            match self.probe.executable_path(entry.pid) {
                Ok(path) => {
                    log::info!(
                        "resolved '{name}' to {} (pid {})",
                        path.display(),
                        entry.pid
                    );
                    return Ok(TargetIdentity::ExecutablePath(path));
                }
                Err(err) => log::debug!("skipping pid {}: {err}", entry.pid),
            }
        }

        Err(NetCtrlError::TargetNotFound {
            name: name.to_string(),
        })
    }

    fn apply_direction(
        &self,
        identity: &TargetIdentity,
        direction: Direction,
    ) -> Result<RuleRecord, NetCtrlError> {
        let TargetIdentity::ExecutablePath(path) = identity else {
            return Err(NetCtrlError::UnsupportedIdentity {
                identity: identity.to_string(),
            });
        };

        let name = self.direction_rule_name(direction);
        let program = path.to_string_lossy();
        run_checked(
            self.runner.as_ref(),
            &add_block_rule(&name, direction, Some(&program)),
        )?;
        log::info!("added firewall rule {name} blocking {direction} traffic of {program}");

        Ok(RuleRecord::new(direction, RuleTarget::FirewallRule(name)))
    }

    fn retract_rule(&self, record: &RuleRecord) {
        match &record.target {
            RuleTarget::FirewallRule(name) => self.delete_rule(name),
            other => log::warn!("netsh backend cannot remove {other:?}"),
        }
    }

    fn find_interface(&self) -> Option<String> {
        None
    }

    fn plan_impairment(&self, impairment: Impairment) -> Result<ImpairmentPlan, NetCtrlError> {
        // Windows Firewall can only drop everything; latency and partial
        // loss have no netsh equivalent.
        if !impairment.is_total_loss() {
            return Err(NetCtrlError::UnsupportedImpairment {
                drop_percent: impairment.drop_percent(),
            });
        }
        Ok(ImpairmentPlan::Block(impairment))
    }

    fn apply_impairment(
        &self,
        plan: &ImpairmentPlan,
        prior: Option<&ImpairmentRecord>,
    ) -> Result<ImpairmentRecord, NetCtrlError> {
        if let Some(prior) = prior {
            self.clear_impairment(prior);
        }

        let ImpairmentPlan::Block(impairment) = plan else {
            return Err(NetCtrlError::UnsupportedImpairment {
                drop_percent: plan.impairment().drop_percent(),
            });
        };

        let mut record = ImpairmentRecord::new(*impairment);
        for direction in [Direction::Inbound, Direction::Outbound] {
            let name = self.lag_rule_name(direction);
            match self.runner.dispatch(&add_block_rule(&name, direction, None)) {
                Ok(handle) => record.push_dispatched(ImpairmentRule::FirewallRule(name), handle),
                Err(err) => {
                    // Undo whatever of this impairment did get installed.
                    let _ = record.settle();
                    self.clear_impairment(&record);
                    return Err(err);
                }
            }
        }
        log::info!("dispatched host-wide block rules for {impairment}");
        Ok(record)
    }

    fn clear_impairment(&self, record: &ImpairmentRecord) {
        for rule in record.rules() {
            match rule {
                ImpairmentRule::FirewallRule(name) => self.delete_rule(name),
                other => log::warn!("netsh backend cannot remove {other:?}"),
            }
        }
    }
}
