use std::sync::Arc;

use anyhow::Result;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt};
use tracing::{error, info};

use desktop_pilot::config::EngineConfig;
use desktop_pilot::controller::WorkflowState;
use desktop_pilot::executor::InputBackend;
use desktop_pilot::llm_gateway::HttpInstructionSource;
use desktop_pilot::orchestrator::Orchestrator;
use desktop_pilot::recorder::EventSink;
use desktop_pilot::vision_client::HttpVisionClient;
use desktop_pilot::visual_driver::Desktop;

#[cfg(target_os = "macos")]
fn platform() -> Result<(Arc<dyn Desktop>, Arc<dyn InputBackend>)> {
    use desktop_pilot::macos::{MacDesktop, MacInput};
    Ok((Arc::new(MacDesktop::new()), Arc::new(MacInput::new())))
}

#[cfg(not(target_os = "macos"))]
fn platform() -> Result<(Arc<dyn Desktop>, Arc<dyn InputBackend>)> {
    anyhow::bail!("Desktop control is only available on macOS")
}

#[cfg(target_os = "macos")]
fn attach_listener(sink: EventSink) -> Result<()> {
    desktop_pilot::macos::start_event_tap(sink)
}

#[cfg(not(target_os = "macos"))]
fn attach_listener(_sink: EventSink) -> Result<()> {
    anyhow::bail!("Input recording is only available on macOS")
}

fn print_help() {
    println!("Available commands:");
    println!("  run <instruction>      - Drive the desktop step by step");
    println!("  workflow <instruction> - Plan all steps first, recover failures step by step");
    println!("  replay <name>          - Replay a saved history or recording");
    println!("  history                - List saved histories and recordings");
    println!("  show <name>            - Print a saved action list");
    println!("  record start           - Start recording mouse and keyboard");
    println!("  record stop <name>     - Stop recording and save it as <name>");
    println!("  status                 - Show the latest status line");
    println!("  stop                   - Cancel the running task");
    println!("  quit                   - Exit");
}

async fn prompt() {
    print!("> ");
    let _ = io::stdout().flush().await;
}

/// Long-running commands go to their own task so `stop` stays responsive.
fn spawn_task(orchestrator: &Arc<Orchestrator>, cmd: &str, arg: String) {
    if orchestrator.is_busy() {
        println!("A task is already running. Use 'stop' first.");
        return;
    }
    let orch = Arc::clone(orchestrator);
    let cmd = cmd.to_string();
    tokio::spawn(async move {
        match cmd.as_str() {
            "run" => match orch.run_instruction(&arg).await {
                Ok(outcome) => println!("\n[Run] {:?}", outcome),
                Err(e) => println!("\n[Run] Failed: {}", e),
            },
            "workflow" => match orch.run_workflow(&arg).await {
                Ok(report) => match report.final_state() {
                    Some(WorkflowState::Aborted { step, reason }) => {
                        println!("\n[Workflow] Aborted at step {}: {}", step, reason)
                    }
                    _ if report.entered_recovery() => println!("\n[Workflow] Completed with recovery"),
                    _ => println!("\n[Workflow] Completed"),
                },
                Err(e) => println!("\n[Workflow] Failed: {}", e),
            },
            "replay" => match orch.replay(&arg).await {
                Ok(report) => println!(
                    "\n[Replay] {} executed, {} failed{}",
                    report.executed,
                    report.failed,
                    if report.finished { ", reached finish" } else { "" }
                ),
                Err(e) => println!("\n[Replay] Failed: {}", e),
            },
            _ => {}
        }
        prompt().await;
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();
    let (desktop, backend) = platform()?;
    let vision = Arc::new(HttpVisionClient::new(&config.vision_url)?);
    let instructions = Arc::new(HttpInstructionSource::new(
        &config.llm_base_url,
        config.llm_api_key.as_deref(),
        &config.llm_model,
    )?);
    let orchestrator = Arc::new(Orchestrator::new(config, desktop, backend, vision, instructions)?);

    info!("Desktop pilot started");
    println!("Desktop pilot ready. Type 'help' for commands. (Needs Accessibility and Screen Recording permissions)");

    let stdin = io::stdin();
    let mut reader = io::BufReader::new(stdin);
    let mut buffer = String::new();

    prompt().await;
    while reader.read_line(&mut buffer).await? > 0 {
        let input = buffer.trim().to_string();
        buffer.clear();

        let (cmd, rest) = match input.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (input.as_str(), ""),
        };

        match cmd {
            "" => {}
            "help" => print_help(),
            "quit" | "exit" => {
                orchestrator.stop();
                break;
            }
            "replay" if rest.is_empty() => println!("Usage: replay <name>"),
            "run" | "workflow" if rest.is_empty() => println!("Usage: {} <instruction>", cmd),
            "run" | "workflow" | "replay" => spawn_task(&orchestrator, cmd, rest.to_string()),
            "stop" => orchestrator.stop(),
            "status" => println!("{}", orchestrator.status().current()),
            "history" => {
                match orchestrator.list_histories() {
                    Ok(names) => {
                        println!("Histories:");
                        names.iter().for_each(|n| println!("  {}", n));
                    }
                    Err(e) => println!("Failed to list histories: {}", e),
                }
                match orchestrator.list_recordings() {
                    Ok(names) => {
                        println!("Recordings:");
                        names.iter().for_each(|n| println!("  {}", n));
                    }
                    Err(e) => println!("Failed to list recordings: {}", e),
                }
            }
            "show" if rest.is_empty() => println!("Usage: show <name>"),
            "show" => match orchestrator.show(rest) {
                Ok((kind, actions)) => {
                    println!("{:?} '{}' ({} action(s)):", kind, rest, actions.len());
                    for action in actions {
                        println!("  {}", action.to_value());
                    }
                }
                Err(e) => println!("{}", e),
            },
            "record" => match rest.split_once(char::is_whitespace).unwrap_or((rest, "")) {
                ("start", _) => match orchestrator.start_recording() {
                    Ok(sink) => match attach_listener(sink) {
                        Ok(()) => println!("Recording. Use 'record stop <name>' to save."),
                        Err(e) => {
                            error!("Failed to attach input listener: {}", e);
                            orchestrator.discard_recording();
                        }
                    },
                    Err(e) => println!("{}", e),
                },
                ("stop", name) if !name.trim().is_empty() => match orchestrator.stop_recording(name.trim()) {
                    Ok((path, count)) => println!("Saved {} action(s) to {:?}", count, path),
                    Err(e) => println!("{}", e),
                },
                _ => println!("Usage: record start | record stop <name>"),
            },
            _ => println!("Unknown command. Type 'help'."),
        }

        prompt().await;
    }

    Ok(())
}
