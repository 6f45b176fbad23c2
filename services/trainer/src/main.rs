//! Main Entrypoint for the Rehearse voice trainer
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the scenario prompt.
//! 2. Wiring the voice engine to the local audio devices, Gemini Live and
//!    the persistence API.
//! 3. Running one roleplay session, printing its events and reading the
//!    trainee's commands from stdin until the session ends.

mod audio;
mod config;
mod terminal;

use anyhow::Context;
use clap::Parser;
use gemini_realtime::GeminiConnector;
use rehearse_core::config::EngineConfig;
use rehearse_core::lifecycle::SessionManager;
use rehearse_core::persistence::HttpPersistence;
use std::{collections::HashMap, fs, path::Path, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::audio::CpalBackend;
use crate::config::Config;
use crate::terminal::{Command, View};

#[derive(Parser, Debug)]
#[command(version, about = "Rehearse a roleplay conversation by voice")]
struct Args {
    /// Training session to join.
    #[arg(long)]
    session_id: String,
    /// The session already has recorded turns; continue it instead of
    /// starting a fresh conversation.
    #[arg(long)]
    resume: bool,
    /// Scenario prompt to load from PROMPTS_PATH (file name without `.md`).
    #[arg(long, default_value = "system_prompt")]
    scenario: String,
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Could not read prompts directory {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;
    let engine_config = EngineConfig::from_env().context("Invalid engine configuration")?;

    // --- 2. Initialize Logging ---
    // stdout belongs to the conversation; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(config.log_level).into())
                .from_env_lossy(),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Preparing voice session...");

    // --- 3. Initialize Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    let instructions = prompts
        .get(&args.scenario)
        .with_context(|| format!("{}.md not found in prompts directory", args.scenario))?
        .clone();

    let mut connector = GeminiConnector::new(config.gemini_api_key.clone());
    if let Some(model) = &config.gemini_model {
        connector = connector.with_model(model.clone());
    }
    if let Some(voice) = &config.gemini_voice {
        connector = connector.with_voice(voice.clone());
    }
    let persistence = HttpPersistence::new(&config.persistence_url)
        .context("Failed to build persistence client")?;

    let manager = SessionManager::new(
        Arc::new(connector),
        Arc::new(CpalBackend),
        Arc::new(persistence),
        engine_config,
        instructions,
    );

    // --- 4. Start Session ---
    info!(
        session_id = %args.session_id,
        resume = args.resume,
        scenario = %args.scenario,
        "Starting voice session"
    );
    let handle = match manager.start(&args.session_id, args.resume).await {
        Ok(handle) => handle,
        Err(e) => {
            if e.is_fatal() {
                if let Some(guidance) = e.retry_guidance() {
                    eprintln!("{guidance}");
                }
            }
            return Err(e).context("Failed to start voice session");
        }
    };
    println!("{}", terminal::HELP);

    // --- 5. Conversation Loop ---
    let mut events = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut view = View::default();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    for line in view.render(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Terminal fell behind; skipped events"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match terminal::parse_command(&line, view.assessment()) {
                    Some(Command::ToggleMic) => handle.toggle_mic(),
                    Some(Command::Answer(option_id)) => handle.submit_assessment_answer(option_id),
                    Some(Command::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("{}", terminal::HELP),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = handle.closed() => {
                info!("Voice session ended.");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Ending session...");
                break;
            }
        }
    }

    manager.end().await;
    info!("Session closed.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_prompts_reads_markdown_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::File::create(dir.path().join("system_prompt.md"))
            .unwrap()
            .write_all(b"You are an upset customer.")
            .unwrap();
        fs::File::create(dir.path().join("notes.txt"))
            .unwrap()
            .write_all(b"ignored")
            .unwrap();

        let prompts = load_prompts(dir.path()).unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts["system_prompt"], "You are an upset customer.");
    }

    #[test]
    fn test_load_prompts_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_prompts(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["rehearse", "--session-id", "abc", "--resume"]).unwrap();
        assert_eq!(args.session_id, "abc");
        assert!(args.resume);
        assert_eq!(args.scenario, "system_prompt");
        assert!(Args::try_parse_from(["rehearse"]).is_err());
    }
}
