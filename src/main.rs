use std::sync::Arc;

use clap::Parser;
use netctrl::{
    cli::{Args, SettingsLoader, shell},
    error::NetCtrlError,
    exec::{CommandRunner, DryRunRunner, SystemRunner},
    privilege::Privilege,
    process::SystemProcessProbe,
    runtime::{Platform, backend_for},
    session::Session,
};

#[tokio::main]
async fn main() -> Result<(), NetCtrlError> {
    env_logger::init();

    let args = Args::parse();
    let settings = SettingsLoader::load(&args)?;

    let privilege = if settings.dry_run {
        Privilege::Elevated
    } else {
        Privilege::detect()
    };
    if privilege == Privilege::Unprivileged {
        eprintln!("ERROR: Run as administrator/root!");
        if cfg!(windows) {
            eprintln!("Right-click and 'Run as Administrator'");
        } else {
            eprintln!("Use: sudo netctrl [TARGET]");
        }
        std::process::exit(1);
    }

    let Some(platform) = Platform::current() else {
        eprintln!("ERROR: only Linux and Windows are supported");
        std::process::exit(1);
    };

    let runner: Arc<dyn CommandRunner> = if settings.dry_run {
        Arc::new(DryRunRunner)
    } else {
        Arc::new(SystemRunner)
    };
    let backend = backend_for(
        platform,
        &settings.backend,
        runner,
        Arc::new(SystemProcessProbe),
    );
    backend.ensure_base_chains()?;

    let mut session = Session::new(backend, privilege);
    shell::run(&mut session, &settings).await
}
