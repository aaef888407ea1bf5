mod audio;
mod config;
mod gateway;
mod openai;
mod speech;
mod sse;

use crate::config::Config;
use anyhow::{Context, Result};
use argus_core::SessionEvent;
use argus_core::functions::{FunctionCallBroker, VisionRequestHandler, vision_function_spec};
use argus_core::orchestrator::{SessionConfig, SessionOrchestrator};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(about = "Realtime voice-and-vision conversational agent")]
struct Cli {
    /// Override the assistant's system prompt.
    #[arg(long)]
    instructions: Option<String>,

    /// Override the opening greeting.
    #[arg(long)]
    greeting: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load application configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting agent service...");

    let args = Cli::parse();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    // The cpal stream is not Send, so it stays on the main task; the
    // synthesizer only gets the ring-buffer handle.
    let (output, _output_stream) =
        audio::start_output(audio::OUTPUT_LATENCY_MS).context("Failed to start audio output")?;

    let model = Arc::new(openai::ChatCompletionsModel::new(http.clone(), &config));
    let synthesizer = Arc::new(speech::SpeakerSynthesizer::new(
        http,
        &config,
        Arc::clone(&output),
    ));

    // One typed mailbox feeds the orchestrator: chat events from the
    // gateway and completion events from the function broker.
    let (events_tx, events_rx) = tokio::sync::mpsc::channel::<SessionEvent>(64);
    let (gateway, video) = gateway::Gateway::new(events_tx.clone());

    let mut broker = FunctionCallBroker::new(events_tx.clone());
    broker.register(vision_function_spec(), Arc::new(VisionRequestHandler));

    let mut session_config = SessionConfig {
        track_wait: Duration::from_secs(config.track_wait_secs),
        ..SessionConfig::default()
    };
    if let Some(instructions) = args.instructions {
        session_config.system_prompt = instructions;
    }
    if let Some(greeting) = args.greeting {
        session_config.greeting = greeting;
    }

    let orchestrator = SessionOrchestrator::new(
        session_config,
        model,
        synthesizer,
        Arc::new(video),
        broker,
        events_rx,
    );

    let listener = tokio::net::TcpListener::bind(&config.gateway_addr)
        .await
        .with_context(|| format!("Failed to bind gateway address {}", config.gateway_addr))?;
    tracing::info!("Gateway listening on {}", config.gateway_addr);

    let server = tokio::spawn(async move { axum::serve(listener, gateway.router()).await });
    let session = tokio::spawn(orchestrator.run());

    tokio::select! {
        result = server => match result {
            Ok(Ok(())) => tracing::info!("Gateway server stopped"),
            Ok(Err(e)) => tracing::error!("Gateway server failed: {e}"),
            Err(e) => tracing::error!("Gateway server task aborted: {e}"),
        },
        _ = session => {
            tracing::info!("Session ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
            let _ = events_tx.send(SessionEvent::Closed).await;
        }
    }
    tracing::info!("Shutting down...");
    Ok(())
}
