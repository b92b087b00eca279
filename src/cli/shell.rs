use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    error::NetCtrlError,
    model::{Applied, Impairment},
    session::Session,
};

use super::loader::Settings;

/// One line typed at the prompt
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Block,
    BlockOutbound,
    BlockInbound,
    Unblock,
    Lag { lag_ms: u32, drop_percent: f64 },
    Off,
    Status,
    Help,
    Quit,
    Empty,
    Usage(&'static str),
    Unknown(String),
}

/// Whether the prompt loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

const LAG_USAGE: &str = "Usage: lag <ms> <percent>";

pub fn parse_command(line: &str) -> ShellCommand {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return ShellCommand::Empty;
    };

    match command {
        "block" | "b" => ShellCommand::Block,
        "block-out" | "bo" => ShellCommand::BlockOutbound,
        "block-in" | "bi" => ShellCommand::BlockInbound,
        "unblock" | "u" => ShellCommand::Unblock,
        "lag" | "l" => {
            let lag_ms = words.next().and_then(|word| word.parse::<u32>().ok());
            let drop_percent = words.next().and_then(|word| word.parse::<f64>().ok());
            match (lag_ms, drop_percent) {
                (Some(lag_ms), Some(drop_percent)) => ShellCommand::Lag {
                    lag_ms,
                    drop_percent,
                },
                _ => ShellCommand::Usage(LAG_USAGE),
            }
        }
        "off" | "disable" | "d" => ShellCommand::Off,
        "status" | "s" => ShellCommand::Status,
        "help" | "h" | "?" => ShellCommand::Help,
        "quit" | "q" | "exit" => ShellCommand::Quit,
        other => ShellCommand::Unknown(other.to_string()),
    }
}

/// Status tag shown in front of the prompt
pub fn prompt(session: &Session) -> String {
    let blocked = match (session.is_blocked_outbound(), session.is_blocked_inbound()) {
        (true, true) => "[BLOCKED ⬆⬇]",
        (true, false) => "[BLOCKED ⬆]",
        (false, true) => "[BLOCKED ⬇]",
        (false, false) => "[UNBLOCKED]",
    };
    if session.is_impaired() {
        format!("{blocked}[LAG] > ")
    } else {
        format!("{blocked} > ")
    }
}

pub fn print_banner(out: &mut impl Write, settings: &Settings) -> io::Result<()> {
    writeln!(out, "╔══════════════════════════════════════════╗")?;
    writeln!(out, "║   NetCtrl - Network Traffic Blocker      ║")?;
    writeln!(out, "╚══════════════════════════════════════════╝")?;
    writeln!(out)?;
    writeln!(out, "Target process: {}", settings.target)?;
    if settings.dry_run {
        writeln!(out, "Dry run: commands are printed, not executed")?;
    }
    writeln!(out)?;
    print_help(out)
}

fn print_help(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "Commands:")?;
    writeln!(out, "  block-out / bo    - Block OUTBOUND traffic of the target")?;
    writeln!(out, "  block-in  / bi    - Block INBOUND traffic of the target")?;
    writeln!(out, "  block     / b     - Block BOTH directions")?;
    writeln!(out, "  unblock   / u     - Remove every rule")?;
    writeln!(out, "  lag <ms> <%>      - Host-wide lag + packet loss (lag 0 100 blocks all)")?;
    writeln!(out, "  off       / d     - Remove host-wide lag only")?;
    writeln!(out, "  status    / s     - Show status")?;
    writeln!(out, "  quit      / q     - Exit")?;
    writeln!(out)
}

fn print_status(out: &mut impl Write, session: &Session, settings: &Settings) -> io::Result<()> {
    let open_or = |blocked: bool, label: &'static str| if blocked { label } else { "OPEN" };

    writeln!(out)?;
    writeln!(out, "━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
    writeln!(
        out,
        "Target:   {}",
        session.target_name().unwrap_or(settings.target.as_str())
    )?;
    if let Some(identity) = session.identity() {
        writeln!(out, "Locked:   {identity}")?;
    }
    writeln!(
        out,
        "Outbound: {}",
        open_or(session.is_blocked_outbound(), "BLOCKED ⬆")
    )?;
    writeln!(
        out,
        "Inbound:  {}",
        open_or(session.is_blocked_inbound(), "BLOCKED ⬇")
    )?;
    match session.impairment() {
        Some(impairment) => {
            writeln!(out, "Lag:      {}ms", impairment.lag_ms())?;
            writeln!(out, "Drop:     {}%", impairment.drop_percent())?;
        }
        None => writeln!(out, "Lag:      off")?,
    }
    writeln!(out, "━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
    writeln!(out)
}

fn report_block(
    out: &mut impl Write,
    result: Result<Applied, NetCtrlError>,
    done: &str,
    already: &str,
) -> io::Result<()> {
    match result {
        Ok(Applied::Installed) => writeln!(out, "✓ {done}\n"),
        Ok(Applied::AlreadyActive) => writeln!(out, "{already}"),
        Err(err @ NetCtrlError::TargetNotFound { .. }) => {
            writeln!(out, "✗ Failed: {err}. Is the process running?\n")
        }
        Err(err) => writeln!(out, "✗ Failed: {err}\n"),
    }
}

/// Run one command against the session and write what happened to `out`
pub fn execute(
    command: ShellCommand,
    session: &mut Session,
    settings: &Settings,
    out: &mut impl Write,
) -> io::Result<Flow> {
    let target = settings.target.as_str();

    match command {
        ShellCommand::BlockOutbound => report_block(
            out,
            session.block_outbound(target),
            "OUTBOUND BLOCKED! (Process can't send data)",
            "Outbound already blocked!",
        )?,
        ShellCommand::BlockInbound => report_block(
            out,
            session.block_inbound(target),
            "INBOUND BLOCKED! (Process can't receive data)",
            "Inbound already blocked!",
        )?,
        ShellCommand::Block => report_block(
            out,
            session.block(target),
            "FULLY BLOCKED! (No network access)",
            "Already blocked both directions!",
        )?,
        ShellCommand::Unblock => {
            if session.is_active() {
                session.retract();
                writeln!(out, "✓ UNBLOCKED! (Network restored)\n")?;
            } else {
                writeln!(out, "Already unblocked!")?;
            }
        }
        ShellCommand::Lag {
            lag_ms,
            drop_percent,
        } => {
            let result = Impairment::new(lag_ms, drop_percent).and_then(|impairment| {
                if settings.confirm_impairment {
                    session.impair_confirmed(impairment)
                } else {
                    session.impair(impairment)
                }
            });
            match result {
                Ok(()) => writeln!(out, "✓ Applied: {lag_ms}ms + {drop_percent}% drop\n")?,
                Err(err) => writeln!(out, "✗ Failed: {err}\n")?,
            }
        }
        ShellCommand::Off => {
            if session.is_impaired() {
                session.disable_impairment();
                writeln!(out, "✓ Lag disabled\n")?;
            } else {
                writeln!(out, "Lag is not active")?;
            }
        }
        ShellCommand::Status => print_status(out, session, settings)?,
        ShellCommand::Help => print_help(out)?,
        ShellCommand::Quit => return Ok(Flow::Quit),
        ShellCommand::Empty => {}
        ShellCommand::Usage(usage) => writeln!(out, "{usage}\n")?,
        ShellCommand::Unknown(word) => writeln!(
            out,
            "Unknown command '{word}'. Type 'help' for the list of commands\n"
        )?,
    }

    Ok(Flow::Continue)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                log::warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    }
}

/// Interactive prompt loop.
///
/// Ends on `quit`, end of input, or an interrupt; every rule the session
/// owns is removed before returning.
pub async fn run(session: &mut Session, settings: &Settings) -> Result<(), NetCtrlError> {
    let mut stdout = io::stdout();
    print_banner(&mut stdout, settings)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        write!(stdout, "{}", prompt(session))?;
        stdout.flush()?;

        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    writeln!(stdout)?;
                    break;
                };
                if execute(parse_command(&line), session, settings, &mut stdout)? == Flow::Quit {
                    break;
                }
            }
            _ = &mut shutdown => {
                writeln!(stdout, "\n\nRestoring network...")?;
                break;
            }
        }
    }

    session.retract();
    writeln!(stdout, "Goodbye!")?;
    Ok(())
}
