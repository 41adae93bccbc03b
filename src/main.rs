//! livetutor - terminal front end
//!
//! Starts a session right away and reads single-letter commands from stdin:
//! `m` toggles mute, `h` hangs up, `s` starts again, `d` dismisses an error,
//! `q` quits.

#![forbid(unsafe_code)]

use anyhow::Context;
use livetutor::pulse::PulseBackend;
use livetutor::transcript::Role;
use livetutor::{ConnectionState, GeminiConnector, SessionConfig, SessionController, SessionHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const METER_WIDTH: usize = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting livetutor");

    let config = SessionConfig::from_env().context("loading configuration")?;
    let backend = PulseBackend::new("livetutor").with_input_device(config.input_device.clone());
    let (controller, handle) = SessionController::new(config, backend, GeminiConnector);
    let controller_task = tokio::spawn(controller.run());

    let presenter = tokio::spawn(present(handle.clone()));
    handle.start()?;
    println!("Commands: [m]ute, [h]ang up, [s]tart, [d]ismiss error, [q]uit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let sent = match line.trim() {
            "m" => handle.toggle_mute(),
            "h" => handle.hang_up(),
            "s" => handle.start(),
            "d" => handle.dismiss_error(),
            "q" => break,
            "" => continue,
            other => {
                warn!("Unknown command: {}", other);
                continue;
            }
        };
        sent?;
    }

    handle.shutdown()?;
    controller_task.await.context("session controller panicked")?;
    presenter.abort();
    info!("Bye");
    Ok(())
}

/// Print state changes and the transcript, and a volume meter while connected.
async fn present(handle: SessionHandle) {
    let mut state = handle.watch_state();
    let mut transcript = handle.subscribe_transcript();
    let mut meter = interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Error => println!(
                        "[error] {} (press d to dismiss)",
                        handle.last_error().unwrap_or_default()
                    ),
                    other => println!("[{:?}]", other),
                }
            }
            event = transcript.recv() => match event {
                Ok(event) if !event.is_partial => {
                    let who = match event.role {
                        Role::User => "you",
                        Role::Model => "tutor",
                    };
                    println!("{:>5}: {}", who, event.text);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Transcript display skipped {} updates", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = meter.tick() => {
                if handle.state() == ConnectionState::Connected {
                    let level = (handle.volume() * 4.0).min(1.0);
                    let bars = (level * METER_WIDTH as f32).round() as usize;
                    eprint!(
                        "\r{} [{:<width$}]",
                        if handle.is_muted() { "muted" } else { "  mic" },
                        "#".repeat(bars),
                        width = METER_WIDTH
                    );
                }
            }
        }
    }
}
