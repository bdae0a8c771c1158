//! Hark command-line host.
//!
//! ## Runtime note
//!
//! The providers use reqwest's blocking client, which owns an internal
//! runtime and must be created and dropped outside async code. `main` is
//! therefore synchronous: it builds the collaborators first, then enters a
//! tokio runtime only for the assistant's threads and the event log.
//!
//! The process exits on Ctrl-C, or with an error when the session ends
//! because no input device could be reopened after a capture fault.

mod devices;
mod mcp;
mod providers;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use hark_core::audio::device::CpalCatalog;
use hark_core::{Assistant, Phase, PhaseEvent, TurnEvent, TurnKind};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use mcp::McpTools;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};

const USAGE: &str = "\
usage: hark [--settings PATH] [--list-devices] [--write-default-settings]

  --settings PATH            settings file (default: $HARK_SETTINGS or the user data dir)
  --list-devices             print audio devices and exit
  --write-default-settings   write a settings file with defaults and exit";

#[derive(Debug, Default, PartialEq)]
struct Args {
    settings: Option<PathBuf>,
    list_devices: bool,
    write_default_settings: bool,
    help: bool,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--settings" => {
                let path = raw.next().context("--settings needs a path")?;
                args.settings = Some(PathBuf::from(path));
            }
            "--list-devices" => args.list_devices = true,
            "--write-default-settings" => args.write_default_settings = true,
            "-h" | "--help" => args.help = true,
            other => bail!("unknown argument '{other}'\n\n{USAGE}"),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hark=info,hark_core=info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    if args.list_devices {
        print!("{}", devices::describe(&CpalCatalog));
        return Ok(());
    }

    let path = args.settings.unwrap_or_else(default_settings_path);
    if args.write_default_settings {
        save_settings(&path, &AppSettings::default())
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    info!(settings = %path.display(), "Hark starting");
    let mut settings = load_settings(&path);
    settings.apply_env_overrides();
    devices::apply_policy(&mut settings, &CpalCatalog);

    let tools = McpTools::connect_all(&settings.tool_servers);
    if !settings.tool_servers.is_empty() {
        info!(
            connected = tools.server_count(),
            configured = settings.tool_servers.len(),
            "tool servers"
        );
    }
    let collaborators = providers::build_collaborators(&settings, Arc::new(tools))?;
    let assistant = Assistant::new(settings.assistant.clone(), collaborators)?;

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let guard = rt.enter();

    let log_task = rt.spawn(log_events(
        assistant.subscribe_phase(),
        assistant.subscribe_turns(),
    ));
    assistant.start()?;
    info!(phrases = ?settings.assistant.wake.phrases, "listening for the wake phrase");
    let exit = assistant
        .take_exit()
        .context("assistant started without an exit channel")?;

    // Whichever comes first: Ctrl-C, or the session ending on its own after
    // capture could not be restarted on any device.
    let ended = rt
        .block_on(async {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => signal.map(|()| None),
                result = exit => Ok(Some(result)),
            }
        })
        .context("failed to listen for ctrl-c")?;

    let outcome = match ended {
        None => {
            info!("shutting down");
            if let Err(e) = assistant.stop() {
                warn!("stop: {e}");
            }
            if !wait_for_idle(&assistant, Duration::from_secs(3)) {
                warn!("assistant did not reach idle before timeout");
            }
            Ok(())
        }
        Some(Ok(Ok(()))) => {
            warn!("session ended without a stop request");
            Ok(())
        }
        Some(Ok(Err(e))) => Err(anyhow::Error::new(e).context("session ended")),
        Some(Err(_)) => Err(anyhow::anyhow!("session task exited without a result")),
    };

    let d = assistant.diagnostics_snapshot();
    info!(
        frames = d.frames_in,
        dropped = d.frames_dropped,
        triggers = d.triggers,
        utterances = d.utterances,
        capture_restarts = d.capture_restarts,
        "session summary"
    );

    log_task.abort();
    drop(guard);
    // The blocking HTTP clients inside the collaborators drop here, outside
    // the runtime.
    drop(assistant);
    outcome
}

fn wait_for_idle(assistant: &Assistant, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if assistant.status() == Phase::Idle && !assistant.is_running() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

async fn log_events(
    mut phases: broadcast::Receiver<PhaseEvent>,
    mut turns: broadcast::Receiver<TurnEvent>,
) {
    loop {
        tokio::select! {
            event = phases.recv() => match event {
                Ok(e) => match e.detail {
                    Some(detail) => warn!(phase = ?e.phase, previous = ?e.previous, "{detail}"),
                    None => info!(phase = ?e.phase, previous = ?e.previous, "phase"),
                },
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "phase log lagged"),
                Err(RecvError::Closed) => break,
            },
            event = turns.recv() => match event {
                Ok(t) => match t.kind {
                    TurnKind::Error => warn!(turn = t.turn_id, "turn failed: {}", t.text),
                    kind => info!(turn = t.turn_id, kind = ?kind, "{}", t.text),
                },
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "turn log lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags_and_settings_path() {
        let parsed = args(&["--settings", "/tmp/h.json", "--list-devices"]).expect("args");
        assert_eq!(parsed.settings, Some(PathBuf::from("/tmp/h.json")));
        assert!(parsed.list_devices);
        assert!(!parsed.write_default_settings);
    }

    #[test]
    fn rejects_unknown_and_incomplete_arguments() {
        assert!(args(&["--verbose"]).is_err());
        assert!(args(&["--settings"]).is_err());
        assert_eq!(args(&[]).expect("empty"), Args::default());
    }
}
