//! Interactive session driver.
//!
//! Reads one command per line from stdin and plays the UI and the
//! transports against a live controller:
//!
//! ```text
//! accept | decline
//! info {"topic":"usrA","seq":10,"what":"call","event":"hang-up"}
//! close usrA 10
//! status | quit
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::calling::bridge::SignalSources;
use crate::calling::controller::{CallController, CallHandle};
use crate::calling::signaling::{CallSignaler, HttpSignaler, LogSignaler};
use crate::calling::{
    parse_info_message, CallError, CallRequest, CloseRequest, InfoMessage, LifecycleCommand,
};
use crate::config::Config;

/// One line of console input.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Accept,
    Decline,
    Info(InfoMessage),
    Close(CloseRequest),
    Status,
    Quit,
}

/// Parse a console line. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let input = match word {
        "accept" | "a" => Input::Accept,
        "decline" | "hangup" | "d" => Input::Decline,
        "status" | "s" => Input::Status,
        "quit" | "q" => Input::Quit,
        "info" => {
            let info = parse_info_message(rest).context("Expected an info message as JSON")?;
            Input::Info(info)
        }
        "close" => {
            let mut parts = rest.split_whitespace();
            let topic = parts.next().context("Usage: close <topic> <seq>")?;
            let seq = parts
                .next()
                .context("Usage: close <topic> <seq>")?
                .parse::<i64>()
                .context("Sequence number must be an integer")?;
            Input::Close(CloseRequest {
                topic: topic.to_string(),
                seq,
            })
        }
        other => anyhow::bail!("Unknown command '{}'", other),
    };
    Ok(Some(input))
}

fn signaler_for(config: &Config) -> Arc<dyn CallSignaler> {
    match config.signal_url {
        Some(ref url) => Arc::new(HttpSignaler::new(
            reqwest::Client::new(),
            url.clone(),
            config.auth_token.clone(),
        )),
        None => Arc::new(LogSignaler),
    }
}

fn describe(command: LifecycleCommand) -> &'static str {
    match command {
        LifecycleCommand::ShowIncoming => "Incoming call: accept or decline",
        LifecycleCommand::ShowActive => "Call active",
        LifecycleCommand::Terminate => "Call ended",
    }
}

/// Hand one console input to the controller or the signal sources.
fn apply_input(handle: &CallHandle, sources: &SignalSources, input: Input) -> Result<(), CallError> {
    match input {
        Input::Accept => handle.on_user_accept(),
        Input::Decline => handle.on_user_decline(),
        Input::Info(info) => {
            sources.publish_info(info);
            Ok(())
        }
        Input::Close(request) => {
            sources.on_local_close_request(request);
            Ok(())
        }
        Input::Status => {
            println!("State: {}", handle.state().as_str());
            Ok(())
        }
        Input::Quit => {
            handle.dispose();
            Ok(())
        }
    }
}

/// Run one call session until it ends or the user quits.
pub async fn run_session(request: CallRequest, config: &Config) -> Result<()> {
    let sources = SignalSources::new();
    let (handle, mut commands) =
        CallController::start(request, &sources, config, signaler_for(config))
            .context("Failed to start call session")?;

    match handle.identity() {
        Some(identity) => println!(
            "Call {} (commands: accept, decline, info <json>, close <topic> <seq>, quit)",
            identity
        ),
        None => println!("Call request has no peer topic"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                println!("[UI] {}", describe(command));
                if command == LifecycleCommand::Terminate {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line.context("Failed to read stdin")? {
                    Some(line) => line,
                    None => {
                        stdin_open = false;
                        continue;
                    }
                };
                let input = match parse_input(&line) {
                    Ok(Some(input)) => input,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{:#}", e);
                        continue;
                    }
                };
                if let Err(e) = apply_input(&handle, &sources, input) {
                    println!("Rejected: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                handle.dispose();
            }
        }
    }

    // Give a pending hang-up signal a moment to go out.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
