/// Markers in `/proc/<pid>/cgroup` that identify a sandboxed launch
const SANDBOX_MARKERS: &[&str] = &["flatpak", "app-"];

/// Extract the control-group path of a sandboxed (flatpak / systemd app
/// scope) process from the contents of its cgroup membership file.
///
/// Only the first line is inspected. The path is everything after the last
/// `:` of that line, e.g. `0::/user.slice/.../app-flatpak-org.foo-123.scope`
/// yields `/user.slice/.../app-flatpak-org.foo-123.scope`.
pub(super) fn sandbox_cgroup_path(contents: &str) -> Option<String> {
    let line = contents.lines().next()?;
    if !SANDBOX_MARKERS.iter().any(|marker| line.contains(marker)) {
        return None;
    }

    let (_, path) = line.rsplit_once(':')?;
    let path = path.trim();
    (!path.is_empty()).then(|| path.to_string())
}
