use conversational_agent::{
    agent::ChatAgent,
    config::AgentConfig,
    models::Message,
    scheduler::Scheduler,
    streaming::{StreamEvent, StreamWriter},
};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// One chat turn from the command line:
/// `agent [conversation-id] <message...>`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let conversation_id = match args.first() {
        Some(first) if first.starts_with("--conversation=") => {
            let id = first.trim_start_matches("--conversation=").to_string();
            args.remove(0);
            id
        }
        _ => "cli".to_string(),
    };

    let prompt = args.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("usage: agent [--conversation=<id>] <message>");
        std::process::exit(2);
    }

    let config = AgentConfig::from_env()?;
    let (scheduler, _due_rx) = Scheduler::new();
    let agent = ChatAgent::from_config(config, scheduler)?;

    info!(conversation_id = %conversation_id, "Running chat turn");

    let (writer, mut rx) = StreamWriter::channel(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { delta } => {
                    print!("{}", delta);
                    stdout.flush().ok();
                }
                StreamEvent::ToolCall {
                    tool_name,
                    arguments,
                    requires_confirmation: true,
                    ..
                } => {
                    println!("\n[{} {} needs confirmation]", tool_name, arguments);
                }
                StreamEvent::ToolOutput { tool_call_id, outcome } => {
                    println!("\n[tool {} -> {:?}]", tool_call_id, outcome);
                }
                StreamEvent::Error { message } => eprintln!("\nerror: {}", message),
                _ => {}
            }
        }
        println!();
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = agent
        .on_chat_message(
            &conversation_id,
            vec![Message::user_text(prompt)],
            &writer,
            &cancel,
        )
        .await;
    drop(writer);
    printer.await.ok();

    match result {
        Ok(outcome) => {
            info!(
                finish_reason = ?outcome.finish.finish_reason,
                steps = outcome.finish.steps,
                "Turn finished"
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Chat turn failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
