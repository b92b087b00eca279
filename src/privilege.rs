/// Whether the caller may change system-wide firewall and shaping state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Elevated,
    Unprivileged,
}

impl Privilege {
    pub fn detect() -> Self {
        if is_elevated() {
            Privilege::Elevated
        } else {
            Privilege::Unprivileged
        }
    }
}

/// Effective uid is root
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Process token is a member of the Administrators group
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use windows_sys::Win32::UI::Shell::IsUserAnAdmin;
    unsafe { IsUserAnAdmin() != 0 }
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}
