use crate::{
    exec::{CommandLine, CommandRunner},
    process::ProcessProbe,
};

/// Conventional interface names probed when the routing table gives no answer
pub const DEFAULT_FALLBACK_INTERFACES: &[&str] = &["eth0", "wlan0", "enp0s3", "ens33", "wlp2s0"];

/// Pick the interface carrying the default route, falling back to the first
/// conventional name that exists on this host
pub(super) fn select_interface(
    runner: &dyn CommandRunner,
    probe: &dyn ProcessProbe,
    fallbacks: &[String],
) -> Option<String> {
    let route = CommandLine::new("ip").args(["route", "show", "default"]);
    match runner.first_line(&route) {
        Ok(Some(line)) => {
            if let Some(dev) = default_route_device(&line) {
                log::debug!("default route uses interface {dev}");
                return Some(dev);
            }
        }
        Ok(None) => log::debug!("no default route found"),
        Err(err) => log::warn!("failed to inspect routing table: {err}"),
    }

    let found = fallbacks
        .iter()
        .find(|name| probe.interface_exists(name))
        .cloned();
    if let Some(name) = &found {
        log::debug!("using fallback interface {name}");
    }
    found
}

/// `default via 192.168.1.1 dev wlp3s0 proto dhcp metric 600` -> `wlp3s0`
fn default_route_device(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    tokens.find(|token| *token == "dev")?;
    tokens.next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exec::testing::RecordingRunner, process::MockProcessProbe};
    use rstest::rstest;

    fn fallbacks() -> Vec<String> {
        DEFAULT_FALLBACK_INTERFACES
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    #[rstest]
    #[case("default via 192.168.1.1 dev wlp3s0 proto dhcp metric 600", Some("wlp3s0"))]
    #[case("default dev ppp0 scope link", Some("ppp0"))]
    #[case("default via 10.0.0.1", None)]
    #[case("default via 10.0.0.1 dev", None)]
    fn parses_device(#[case] line: &str, #[case] expected: Option<&str>) {
        assert_eq!(default_route_device(line), expected.map(str::to_string));
    }

    #[test]
    fn prefers_default_route() {
        let runner = RecordingRunner::new();
        runner.push_line(Some("default via 10.0.0.1 dev enp5s0 proto static"));
        let mut probe = MockProcessProbe::new();
        probe.expect_interface_exists().times(0);

        assert_eq!(
            select_interface(&runner, &probe, &fallbacks()),
            Some("enp5s0".to_string())
        );
        assert_eq!(runner.commands(), vec!["ip route show default"]);
    }

    #[test]
    fn falls_back_to_first_existing_interface() {
        let runner = RecordingRunner::new();
        runner.push_line(None);
        let mut probe = MockProcessProbe::new();
        probe
            .expect_interface_exists()
            .returning(|name| name == "enp0s3" || name == "ens33");

        assert_eq!(
            select_interface(&runner, &probe, &fallbacks()),
            Some("enp0s3".to_string())
        );
    }

    #[test]
    fn none_when_nothing_exists() {
        let runner = RecordingRunner::new();
        runner.push_line(None);
        let mut probe = MockProcessProbe::new();
        probe.expect_interface_exists().returning(|_| false);

        assert_eq!(select_interface(&runner, &probe, &fallbacks()), None);
    }
}
