use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sovren_voice::events::EventBus;
use sovren_voice::router::Urgency;
use sovren_voice::synthesis::Backends;
use sovren_voice::{
    CallHints, CallRouter, Config, HeadlessAudio, LoopbackSignaling, PersonaId, Priority,
    SessionStore, SynthesisOptions, SynthesisQueue, VoiceSystemManager,
};

/// SOVREN Voice - executive call routing and speech synthesis
#[derive(Parser)]
#[command(name = "sovren-voice", version, about)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "SOVREN_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Subscription tier override (tier1/basic, tier2/proof_plus)
    #[arg(long)]
    tier: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List the personas reachable on the current tier
    Personas,
    /// Show which persona would take a call
    Route {
        /// Caller id
        #[arg(short, long)]
        caller: String,
        /// Call urgency (low, medium, high, critical)
        #[arg(short, long)]
        urgency: Option<String>,
        /// Free text describing the call purpose
        text: Option<String>,
    },
    /// Synthesize text in a persona's voice to a WAV file
    Synthesize {
        /// Persona whose voice to use
        #[arg(short, long, default_value = "sovren-ai")]
        persona: String,
        /// Output file
        #[arg(short, long, default_value = "speech.wav")]
        output: PathBuf,
        /// Text to speak
        text: String,
    },
    /// Initialize the voice system and print its status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,sovren_voice=info",
        1 => "info,sovren_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(tier) = &cli.tier {
        config.tier = tier.parse()?;
        config.validate()?;
    }
    tracing::debug!(tier = %config.tier, "loaded configuration");

    match cli.command {
        Some(Command::Personas) => cmd_personas(&config),
        Some(Command::Route {
            caller,
            urgency,
            text,
        }) => cmd_route(&config, &caller, urgency.as_deref(), text),
        Some(Command::Synthesize {
            persona,
            output,
            text,
        }) => cmd_synthesize(&config, &persona, &output, &text).await,
        Some(Command::Status) => cmd_status(&config).await,
        None => serve(&config).await,
    }
}

fn cmd_personas(config: &Config) -> anyhow::Result<()> {
    let gate = config.tier_gate()?;
    let allowed = gate.resolve(config.tier, &config.personas)?;

    println!("Tier: {}", config.tier);
    println!("---");
    for p in &allowed {
        let limit = if p.is_unbounded() {
            "unbounded".to_string()
        } else {
            p.max_concurrent_calls.to_string()
        };
        println!(
            "{:<10} {:<28} priority {:>2}  calls {limit:<9}  voice {}",
            p.id.as_str(),
            p.display_role,
            p.priority,
            p.voice_model_id
        );
    }
    Ok(())
}

fn cmd_route(
    config: &Config,
    caller: &str,
    urgency: Option<&str>,
    text: Option<String>,
) -> anyhow::Result<()> {
    let router = CallRouter::from_config(
        config,
        Arc::new(SessionStore::new(&config.sessions)),
        EventBus::default(),
    )?;

    let mut hints = CallHints::new();
    if let Some(urgency) = urgency {
        hints = hints.urgency(urgency.parse::<Urgency>()?);
    }
    if let Some(text) = text {
        hints = hints.text(text);
    }

    let decision = router.route(caller, hints)?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn cmd_synthesize(
    config: &Config,
    persona: &str,
    output: &std::path::Path,
    text: &str,
) -> anyhow::Result<()> {
    let gate = config.tier_gate()?;
    let allowed = gate.resolve(config.tier, &config.personas)?;
    let persona_id = PersonaId::new(persona);
    let profile = allowed
        .iter()
        .find(|p| p.id == persona_id)
        .ok_or_else(|| anyhow::anyhow!("persona {persona} is not available on {}", config.tier))?;

    let queue = SynthesisQueue::new(
        &config.synthesis,
        allowed.iter().map(|p| p.voice_model_id.clone()),
        Backends::from_config(&config.synthesis)?,
        EventBus::default(),
    );
    queue.start([profile.voice_model_id.as_str()]).await;

    let result = queue
        .synthesize(
            text,
            &profile.voice_model_id,
            Priority::High,
            SynthesisOptions::default(),
        )
        .await?;
    std::fs::write(output, &result.audio[..])?;

    println!(
        "Wrote {} ({} ms, {} stage{})",
        output.display(),
        result.duration_ms,
        result.stage,
        if result.degraded { ", degraded" } else { "" }
    );
    queue.shutdown();
    Ok(())
}

async fn build_manager(
    config: &Config,
) -> anyhow::Result<(
    Arc<VoiceSystemManager>,
    tokio::sync::mpsc::Receiver<sovren_voice::SignalingEvent>,
)> {
    let (signaling, rx) = LoopbackSignaling::new();
    let manager = VoiceSystemManager::from_config(
        config,
        Arc::new(HeadlessAudio::new(config.synthesis.sample_rate)),
        Arc::new(signaling),
        Backends::from_config(&config.synthesis)?,
    )?;
    let manager = Arc::new(manager);
    manager.initialize().await?;
    Ok((manager, rx))
}

async fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let (manager, _rx) = build_manager(config).await?;
    println!("{}", serde_json::to_string_pretty(&manager.status())?);
    for e in manager.shutdown().await {
        tracing::warn!(error = %e, "shutdown error");
    }
    Ok(())
}

/// Run headless until interrupted
async fn serve(config: &Config) -> anyhow::Result<()> {
    let (manager, rx) = build_manager(config).await?;
    let status = manager.status();
    tracing::info!(
        tier = %status.tier,
        personas = status.available_personas,
        synthesis = status.synthesis_ready,
        "sovren voice ready"
    );

    let events = tokio::spawn(Arc::clone(&manager).run(rx));
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    for e in manager.shutdown().await {
        tracing::warn!(error = %e, "shutdown error");
    }
    events.abort();
    Ok(())
}
