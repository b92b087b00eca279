use crate::{
    error::NetCtrlError,
    model::{
        Applied, Direction, Impairment, ImpairmentRecord, RuleRecord, SessionState,
        TargetIdentity,
    },
    privilege::Privilege,
    runtime::Backend,
};

/// Lifecycle manager for the rules one blocking session owns.
///
/// The session is the single authority on what is installed: it checks its
/// direction flags before asking the backend for a rule, records only rules
/// whose creation succeeded, and retracts exactly those records. The first
/// successfully resolved target is locked in until a full [`retract`].
///
/// Dropping a session retracts everything it still owns.
///
/// [`retract`]: Session::retract
pub struct Session {
    backend: Box<dyn Backend>,
    privilege: Privilege,
    target_name: Option<String>,
    identity: Option<TargetIdentity>,
    records: Vec<RuleRecord>,
    outbound: bool,
    inbound: bool,
    impairment: Option<ImpairmentRecord>,
}

impl Session {
    pub fn new(backend: Box<dyn Backend>, privilege: Privilege) -> Self {
        Self {
            backend,
            privilege,
            target_name: None,
            identity: None,
            records: Vec::new(),
            outbound: false,
            inbound: false,
            impairment: None,
        }
    }

    pub fn block_outbound(&mut self, name: &str) -> Result<Applied, NetCtrlError> {
        self.block_direction(name, Direction::Outbound)
    }

    pub fn block_inbound(&mut self, name: &str) -> Result<Applied, NetCtrlError> {
        self.block_direction(name, Direction::Inbound)
    }

    /// Block both directions, outbound first.
    ///
    /// Both are attempted even if the first fails; whatever succeeded stays
    /// recorded and the first error is returned.
    pub fn block(&mut self, name: &str) -> Result<Applied, NetCtrlError> {
        let outbound = self.block_outbound(name);
        let inbound = self.block_inbound(name);
        match (outbound?, inbound?) {
            (Applied::AlreadyActive, Applied::AlreadyActive) => Ok(Applied::AlreadyActive),
            _ => Ok(Applied::Installed),
        }
    }

    fn block_direction(&mut self, name: &str, direction: Direction) -> Result<Applied, NetCtrlError> {
        self.require_privilege()?;
        if self.is_direction_blocked(direction) {
            return Ok(Applied::AlreadyActive);
        }

        let identity = self.locked_identity(name)?;
        let record = self.backend.apply_direction(&identity, direction)?;
        self.records.push(record);
        match direction {
            Direction::Outbound => self.outbound = true,
            Direction::Inbound => self.inbound = true,
        }
        Ok(Applied::Installed)
    }

    /// The cached identity, resolving `name` only when none is cached yet
    fn locked_identity(&mut self, name: &str) -> Result<TargetIdentity, NetCtrlError> {
        if let Some(identity) = &self.identity {
            if self.target_name.as_deref() != Some(name) {
                log::warn!(
                    "session is locked to {identity}; ignoring target '{name}' until unblocked"
                );
            }
            return Ok(identity.clone());
        }

        let identity = self.backend.resolve(name)?;
        self.identity = Some(identity.clone());
        self.target_name = Some(name.to_string());
        Ok(identity)
    }

    /// Apply a host-wide impairment without waiting for the kernel to
    /// confirm it.
    ///
    /// The rules may take a few milliseconds to become visible after this
    /// returns; use [`impair_confirmed`](Session::impair_confirmed) when that
    /// window matters. Requests the backend cannot serve fail before the
    /// current impairment is touched; any later failure leaves the session
    /// with no impairment at all.
    pub fn impair(&mut self, impairment: Impairment) -> Result<(), NetCtrlError> {
        self.require_privilege()?;
        let plan = self.backend.plan_impairment(impairment)?;

        let mut prior = self.impairment.take();
        if let Some(prior) = prior.as_mut() {
            settle(prior);
        }
        // From here on the prior rules are removed whatever the outcome.
        self.impairment = Some(self.backend.apply_impairment(&plan, prior.as_ref())?);
        Ok(())
    }

    /// Apply an impairment and wait for every installation command.
    ///
    /// If any of them failed the rules that did get installed are removed
    /// again and the failure returned.
    pub fn impair_confirmed(&mut self, impairment: Impairment) -> Result<(), NetCtrlError> {
        self.impair(impairment)?;

        let Some(record) = self.impairment.as_mut() else {
            return Ok(());
        };
        if let Err(err) = record.settle() {
            self.disable_impairment();
            return Err(err);
        }
        Ok(())
    }

    /// Remove the host-wide impairment, leaving per-process rules in place
    pub fn disable_impairment(&mut self) {
        if let Some(mut record) = self.impairment.take() {
            settle(&mut record);
            self.backend.clear_impairment(&record);
        }
    }

    /// Remove every rule this session created and forget the target.
    ///
    /// Never fails: the state is cleared even if individual removals did not
    /// succeed, since a missing rule is already the desired outcome.
    pub fn retract(&mut self) {
        for record in self.records.drain(..) {
            self.backend.retract_rule(&record);
        }
        self.disable_impairment();

        self.identity = None;
        self.target_name = None;
        self.outbound = false;
        self.inbound = false;
    }

    fn require_privilege(&self) -> Result<(), NetCtrlError> {
        match self.privilege {
            Privilege::Elevated => Ok(()),
            Privilege::Unprivileged => Err(NetCtrlError::PrivilegeDenied),
        }
    }

    fn is_direction_blocked(&self, direction: Direction) -> bool {
        match direction {
            Direction::Outbound => self.outbound,
            Direction::Inbound => self.inbound,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.outbound || self.inbound
    }

    pub fn is_blocked_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_blocked_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_impaired(&self) -> bool {
        self.impairment.is_some()
    }

    /// Anything at all installed
    pub fn is_active(&self) -> bool {
        self.is_blocked() || self.is_impaired()
    }

    pub fn impairment(&self) -> Option<Impairment> {
        self.impairment.as_ref().map(|record| record.impairment)
    }

    pub fn identity(&self) -> Option<&TargetIdentity> {
        self.identity.as_ref()
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    pub fn records(&self) -> &[RuleRecord] {
        &self.records
    }

    pub fn state(&self) -> SessionState {
        match (self.outbound, self.inbound) {
            (true, true) => SessionState::FullyBlocked,
            (false, false) if !self.is_impaired() => SessionState::Unblocked,
            _ => SessionState::PartiallyBlocked,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_active() {
            log::info!("releasing rules on teardown");
        }
        self.retract();
    }
}

/// Wait for outstanding installation commands so removal cannot overtake
/// them, and so that rules which never got installed are not removed
fn settle(record: &mut ImpairmentRecord) {
    if let Err(err) = record.settle() {
        log::warn!("impairment was only partly installed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        exec::testing::RecordingRunner,
        model::{ImpairmentRule, RuleTarget},
        process::MockProcessProbe,
        runtime::{LinuxNetfilter, LinuxOptions, WindowsFirewall},
    };

    fn linux_session(runner: &RecordingRunner, probe: MockProcessProbe) -> Session {
        let backend = LinuxNetfilter::new(
            LinuxOptions::default(),
            Arc::new(runner.clone()),
            Arc::new(probe),
        );
        Session::new(Box::new(backend), Privilege::Elevated)
    }

    fn probe_for(name: &'static str, pid: u32) -> MockProcessProbe {
        let mut probe = MockProcessProbe::new();
        probe
            .expect_find_pid_by_exact_name()
            .returning(move |query| (query == name).then_some(pid));
        probe
            .expect_read_cgroup()
            .returning(|_| Ok("0::/user.slice/session-2.scope\n".to_string()));
        probe
    }

    #[test]
    fn block_outbound_then_inbound_then_unblock() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 500));

        assert_eq!(session.block_outbound("game").unwrap(), Applied::Installed);
        assert!(session.is_blocked_outbound());
        assert!(!session.is_blocked_inbound());
        assert_eq!(session.records().len(), 1);
        assert_eq!(session.state(), SessionState::PartiallyBlocked);

        assert_eq!(session.block_inbound("game").unwrap(), Applied::Installed);
        assert_eq!(session.state(), SessionState::FullyBlocked);

        runner.clear();
        session.retract();

        assert!(!session.is_blocked());
        assert!(session.records().is_empty());
        assert!(session.identity().is_none());
        assert_eq!(
            runner.commands(),
            vec![
                "iptables -w -D NETCTRL_OUT -m owner --pid-owner 500 -j DROP",
                "iptables -w -D NETCTRL_IN -m owner --pid-owner 500 -j DROP",
            ]
        );
    }

    #[test]
    fn outbound_only_installs_no_inbound_rule() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 500));

        session.block_outbound("game").unwrap();

        assert!(runner.commands().iter().all(|cmd| !cmd.contains("NETCTRL_IN")));
        assert!(
            session
                .records()
                .iter()
                .all(|record| record.direction == Direction::Outbound)
        );
    }

    #[test]
    fn repeated_block_is_already_active() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 500));

        session.block_outbound("game").unwrap();
        assert_eq!(
            session.block_outbound("game").unwrap(),
            Applied::AlreadyActive
        );
        assert_eq!(runner.commands().len(), 1);
        assert_eq!(session.records().len(), 1);
    }

    #[test]
    fn missing_process_leaves_state_untouched() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 500));

        assert!(matches!(
            session.block_outbound("nothing"),
            Err(NetCtrlError::TargetNotFound { .. })
        ));
        assert!(session.identity().is_none());
        assert!(session.records().is_empty());
        assert!(runner.commands().is_empty());
        assert_eq!(session.state(), SessionState::Unblocked);
    }

    #[test]
    fn target_is_locked_to_first_resolution() {
        let runner = RecordingRunner::new();
        let mut probe = MockProcessProbe::new();
        probe
            .expect_find_pid_by_exact_name()
            .times(1)
            .returning(|_| Some(500));
        probe
            .expect_read_cgroup()
            .times(1)
            .returning(|_| Ok(String::new()));
        let mut session = linux_session(&runner, probe);

        session.block_outbound("game").unwrap();
        session.block_inbound("other").unwrap();

        assert_eq!(session.target_name(), Some("game"));
        assert_eq!(
            session.records()[1].target,
            RuleTarget::PidOwner {
                chain: "NETCTRL_IN".to_string(),
                pid: 500
            }
        );
    }

    #[test]
    fn partial_failure_keeps_successful_direction() {
        let runner = RecordingRunner::new();
        runner.fail_when("-A NETCTRL_IN", 1);
        let mut session = linux_session(&runner, probe_for("game", 500));

        assert!(matches!(
            session.block("game"),
            Err(NetCtrlError::RuleCommandFailed { .. })
        ));
        assert!(session.is_blocked_outbound());
        assert!(!session.is_blocked_inbound());
        assert_eq!(session.records().len(), 1);
    }

    #[test]
    fn block_reports_already_active_when_both_set() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 500));

        assert_eq!(session.block("game").unwrap(), Applied::Installed);
        assert_eq!(session.block("game").unwrap(), Applied::AlreadyActive);
        assert_eq!(session.records().len(), 2);
    }

    #[test]
    fn retract_twice_is_idempotent() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 500));
        session.block("game").unwrap();

        session.retract();
        runner.clear();
        session.retract();

        assert!(runner.commands().is_empty());
        assert_eq!(session.state(), SessionState::Unblocked);
        assert!(session.records().is_empty());
    }

    #[test]
    fn unprivileged_session_refuses_to_mutate() {
        let runner = RecordingRunner::new();
        let backend = LinuxNetfilter::new(
            LinuxOptions::default(),
            Arc::new(runner.clone()),
            Arc::new(MockProcessProbe::new()),
        );
        let mut session = Session::new(Box::new(backend), Privilege::Unprivileged);

        assert!(matches!(
            session.block_outbound("game"),
            Err(NetCtrlError::PrivilegeDenied)
        ));
        assert!(matches!(
            session.impair(Impairment::full_block()),
            Err(NetCtrlError::PrivilegeDenied)
        ));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn reimpairing_deletes_qdisc_exactly_once() {
        let runner = RecordingRunner::new();
        runner.push_line(Some("default via 10.0.0.1 dev eth0"));
        runner.push_line(Some("default via 10.0.0.1 dev eth0"));
        let mut session = linux_session(&runner, MockProcessProbe::new());

        session.impair(Impairment::new(100, 50.0).unwrap()).unwrap();
        session.impair(Impairment::new(0, 99.5).unwrap()).unwrap();

        let commands = runner.commands();
        let first_add = commands
            .iter()
            .position(|cmd| cmd.starts_with("tc qdisc add"))
            .unwrap();
        let second_add = commands
            .iter()
            .rposition(|cmd| cmd.starts_with("tc qdisc add"))
            .unwrap();
        let deletions_between = commands[first_add..second_add]
            .iter()
            .filter(|cmd| cmd.starts_with("tc qdisc del"))
            .count();
        assert_eq!(deletions_between, 1);
        assert_eq!(
            commands[second_add],
            "tc qdisc add dev eth0 root netem loss 99.50%"
        );
        assert_eq!(
            session.impairment(),
            Some(Impairment::new(0, 99.5).unwrap())
        );
    }

    #[test]
    fn unplannable_impairment_keeps_prior_record() {
        let runner = RecordingRunner::new();
        runner.push_line(Some("default via 10.0.0.1 dev eth0"));
        runner.push_line(None);
        let mut probe = MockProcessProbe::new();
        probe.expect_interface_exists().returning(|_| false);
        let mut session = linux_session(&runner, probe);

        session.impair(Impairment::new(100, 0.0).unwrap()).unwrap();
        runner.clear();
        assert!(matches!(
            session.impair(Impairment::new(200, 0.0).unwrap()),
            Err(NetCtrlError::InterfaceNotFound)
        ));
        assert_eq!(
            session.impairment(),
            Some(Impairment::new(100, 0.0).unwrap())
        );
        assert_eq!(runner.commands(), vec!["ip route show default"]);
    }

    #[test]
    fn failed_reimpairment_forgets_removed_prior() {
        let runner = RecordingRunner::new();
        runner.push_line(Some("default via 10.0.0.1 dev eth0"));
        runner.fail_dispatch("tc qdisc add");
        let mut session = linux_session(&runner, MockProcessProbe::new());

        session.impair(Impairment::full_block()).unwrap();
        assert!(matches!(
            session.impair(Impairment::new(100, 10.0).unwrap()),
            Err(NetCtrlError::CommandSpawn { .. })
        ));
        assert!(!session.is_impaired());
        assert_eq!(session.impairment(), None);

        let removals: Vec<_> = runner
            .commands()
            .into_iter()
            .filter(|cmd| cmd.contains(" -D "))
            .collect();
        assert_eq!(
            removals,
            vec![
                "iptables -w -D INPUT -m comment --comment NETCTRL_IN -j DROP",
                "iptables -w -D OUTPUT -m comment --comment NETCTRL_OUT -j DROP",
            ]
        );

        runner.clear();
        session.retract();
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn confirmed_impairment_removes_only_installed_rules() {
        let runner = RecordingRunner::new();
        runner.fail_when("-I OUTPUT 1", 1);
        let mut session = linux_session(&runner, MockProcessProbe::new());

        assert!(matches!(
            session.impair_confirmed(Impairment::full_block()),
            Err(NetCtrlError::RuleCommandFailed { .. })
        ));
        assert!(!session.is_impaired());
        assert_eq!(
            runner.commands(),
            vec![
                "iptables -w -I INPUT 1 -m comment --comment NETCTRL_IN -j DROP",
                "iptables -w -I OUTPUT 1 -m comment --comment NETCTRL_OUT -j DROP",
                "iptables -w -D INPUT -m comment --comment NETCTRL_IN -j DROP",
            ]
        );
    }

    #[test]
    fn unconfirmed_failure_is_pruned_before_removal() {
        let runner = RecordingRunner::new();
        runner.fail_when("-I INPUT 1", 1);
        let mut session = linux_session(&runner, MockProcessProbe::new());

        session.impair(Impairment::full_block()).unwrap();
        runner.clear();
        session.disable_impairment();

        assert_eq!(
            runner.commands(),
            vec!["iptables -w -D OUTPUT -m comment --comment NETCTRL_OUT -j DROP"]
        );
    }

    #[test]
    fn disable_impairment_keeps_process_rules() {
        let runner = RecordingRunner::new();
        let mut session = linux_session(&runner, probe_for("game", 9));
        session.block_outbound("game").unwrap();
        session.impair(Impairment::full_block()).unwrap();
        assert!(session.is_active());

        session.disable_impairment();

        assert!(!session.is_impaired());
        assert!(session.is_blocked_outbound());
        assert_eq!(session.records().len(), 1);
    }

    #[test]
    fn drop_retracts_everything() {
        let runner = RecordingRunner::new();
        {
            let mut session = linux_session(&runner, probe_for("game", 9));
            session.block("game").unwrap();
            session.impair(Impairment::full_block()).unwrap();
            runner.clear();
        }

        assert_eq!(
            runner.commands(),
            vec![
                "iptables -w -D NETCTRL_OUT -m owner --pid-owner 9 -j DROP",
                "iptables -w -D NETCTRL_IN -m owner --pid-owner 9 -j DROP",
                "iptables -w -D INPUT -m comment --comment NETCTRL_IN -j DROP",
                "iptables -w -D OUTPUT -m comment --comment NETCTRL_OUT -j DROP",
            ]
        );
    }

    #[test]
    fn windows_session_issues_one_delete_per_direction() {
        let runner = RecordingRunner::new();
        let mut probe = MockProcessProbe::new();
        probe.expect_list_processes().returning(|| {
            vec![crate::process::ProcessEntry {
                pid: 31,
                name: "game.exe".to_string(),
            }]
        });
        probe
            .expect_executable_path()
            .returning(|_| Ok(std::path::PathBuf::from(r"C:\game.exe")));
        let backend = WindowsFirewall::new("netctrl", Arc::new(runner.clone()), Arc::new(probe));
        let mut session = Session::new(Box::new(backend), Privilege::Elevated);

        session.block("game").unwrap();
        runner.clear();
        session.retract();

        assert_eq!(
            runner.commands(),
            vec![
                "netsh advfirewall firewall delete rule name=netctrl_out",
                "netsh advfirewall firewall delete rule name=netctrl_in",
            ]
        );
    }

    #[test]
    fn windows_partial_loss_fails_cleanly() {
        let runner = RecordingRunner::new();
        let backend = WindowsFirewall::new(
            "netctrl",
            Arc::new(runner.clone()),
            Arc::new(MockProcessProbe::new()),
        );
        let mut session = Session::new(Box::new(backend), Privilege::Elevated);

        assert!(matches!(
            session.impair(Impairment::new(0, 50.0).unwrap()),
            Err(NetCtrlError::UnsupportedImpairment { .. })
        ));
        assert!(!session.is_impaired());
        session.impair(Impairment::full_block()).unwrap();
        assert!(matches!(
            session.impairment(),
            Some(impairment) if impairment.is_total_loss()
        ));
        assert_eq!(
            session
                .impairment
                .as_ref()
                .map(|record| record.rules().cloned().collect::<Vec<_>>()),
            Some(vec![
                ImpairmentRule::FirewallRule("netctrl_lag_in".to_string()),
                ImpairmentRule::FirewallRule("netctrl_lag_out".to_string()),
            ])
        );
    }

    #[test]
    fn windows_failed_reimpairment_forgets_removed_prior() {
        let runner = RecordingRunner::new();
        let backend = WindowsFirewall::new(
            "netctrl",
            Arc::new(runner.clone()),
            Arc::new(MockProcessProbe::new()),
        );
        let mut session = Session::new(Box::new(backend), Privilege::Elevated);

        session.impair(Impairment::full_block()).unwrap();
        runner.fail_dispatch("name=netctrl_lag_in");
        assert!(matches!(
            session.impair(Impairment::full_block()),
            Err(NetCtrlError::CommandSpawn { .. })
        ));
        assert_eq!(session.impairment(), None);

        runner.clear();
        session.retract();
        assert!(runner.commands().is_empty());
    }
}
