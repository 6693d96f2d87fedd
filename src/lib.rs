pub mod backend;
pub mod capture;
pub mod commands;
pub mod config;
pub mod errors;
pub mod guided_fix;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;

use crate::backend::provider::GuidanceBackend;
use crate::backend::providers::http_json::HttpJsonBackend;
use crate::capture::frame_source::DirectoryCamera;
use crate::capture::traits::SpeechFlag;
use crate::commands::{parse_command, Command, HELP};
use crate::errors::{GuidedFixError, GuidedFixResult};
use crate::guided_fix::context::RepairProblem;
use crate::guided_fix::engine::GuidedFixEngine;
use crate::guided_fix::event_bus::SessionNotice;
use crate::guided_fix::history::SessionHistory;
use crate::guided_fix::session::SessionHandle;
use crate::guided_fix::state::GuidedFixEvent;

pub async fn run() -> GuidedFixResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let config = config::load_config()?;
    let backend: Arc<dyn GuidanceBackend> = Arc::new(HttpJsonBackend::from_config(&config.backend)?);

    let frames_dir = config
        .camera
        .frames_dir
        .clone()
        .ok_or_else(|| GuidedFixError::Config("camera.frames_dir is not set".into()))?;
    let camera = Arc::new(DirectoryCamera::open(&frames_dir)?);
    let speech = Arc::new(SpeechFlag::new());

    let history = config.history.enabled.then(SessionHistory::new);
    let session = SessionHandle::new(
        RepairProblem::from(&config.session),
        config.session.expected_item.clone(),
        config.policy.clone(),
        history,
    );

    let printer = tokio::spawn(print_notices(session.clone(), Arc::clone(&speech)));

    let mut engine = GuidedFixEngine::new(
        session.clone(),
        camera,
        speech,
        backend,
        config.scheduler.clone(),
    );
    tracing::info!("spawning guided-fix engine");
    let mut engine_task = tokio::spawn(async move { engine.run_loop().await });

    println!("{HELP}");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let final_state = loop {
        tokio::select! {
            done = &mut engine_task => {
                break done.map_err(|e| GuidedFixError::Task(e.to_string()))?;
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => handle_line(&session, &line),
                    None => {
                        stdin_open = false;
                        session.dispatch(GuidedFixEvent::SessionStopped);
                    }
                }
            }
        }
    };

    printer.abort();
    tracing::info!(state = ?final_state.kind(), "guided-fix finished");
    Ok(())
}

fn handle_line(session: &SessionHandle, line: &str) {
    match parse_command(line) {
        Ok(Command::Dispatch(events)) => {
            let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
            if session.dispatch_all(events) == 0 {
                println!("({} does not apply right now)", names.join(", "));
            }
        }
        Ok(Command::Status) => {
            let snap = session.snapshot();
            match serde_json::to_string_pretty(&snap.state) {
                Ok(text) => println!("{text}"),
                Err(e) => tracing::warn!(error = %e, "failed to render state"),
            }
            if let Some(g) = &snap.context.current_guidance {
                println!("guidance: {} (confidence {:.2})", g.instruction, g.confidence);
            }
            println!(
                "step {}/{} · plan revision {}",
                snap.context.current_step_index + 1,
                snap.context.total_steps(),
                snap.context.plan_revision
            );
        }
        Ok(Command::Help) => println!("{HELP}"),
        Err(msg) => println!("{msg}"),
    }
}

/// Stand-in voice layer: prints notices, flagging speech while it does.
async fn print_notices(session: SessionHandle, speech: Arc<SpeechFlag>) {
    let mut rx = session.bus().subscribe();
    loop {
        match rx.recv().await {
            Ok(SessionNotice::Narration { text }) => {
                speech.set_speaking(true);
                println!("» {text}");
                speech.set_speaking(false);
            }
            Ok(SessionNotice::SafetyWarning { text }) => println!("⚠ {text}"),
            Ok(SessionNotice::StaleResponseDiscarded { received, active }) => {
                tracing::debug!(%received, ?active, "stale response discarded");
            }
            Ok(SessionNotice::SessionEnded { final_state }) => {
                println!("session ended ({final_state:?})");
            }
            Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "notice printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
