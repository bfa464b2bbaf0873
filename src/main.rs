//! speechd-gateway - synthesize text through a resilient chain of TTS engines
//!
//! Each invocation builds the gateway from configuration, probes the engines and runs a
//! single command against it.

use clap::{Parser, Subcommand};
use speechd_gateway::backends::BackendRegistry;
use speechd_gateway::config_loader::Settings;
use speechd_gateway::{
    ErrorClassifier, RequestContext, SynthesisOrchestrator, SynthesisRequest, VoiceRegistry,
    VoiceResolver,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Speech synthesis gateway with engine fallback
#[derive(Parser)]
#[command(name = "speechd-gateway")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Synthesize speech through a ranked chain of TTS engines", long_about = None)]
struct Cli {
    /// Configuration file (TOML/YAML/JSON). Defaults to ./Gateway.* and ~/.config/speechd-gateway/
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize text and write the audio to a file
    Speak {
        /// Text to speak
        text: String,
        /// Generic voice ID, engine voice ID or description ("british male")
        #[arg(short, long)]
        voice: Option<String>,
        /// Engine to try first
        #[arg(short, long)]
        engine: Option<String>,
        /// Total attempt budget across engines
        #[arg(short, long)]
        retries: Option<u32>,
        /// Usage context, e.g. travel_planning
        #[arg(long)]
        context: Option<String>,
        /// Region code, e.g. AU
        #[arg(long)]
        region: Option<String>,
        /// Output file for the audio ("-" for stdout)
        #[arg(short, long, default_value = "speech.wav")]
        out: PathBuf,
    },

    /// Probe engines and print gateway status as JSON
    Status,

    /// Show which identity and engine voices a voice input resolves to
    Resolve {
        /// Voice input (omit to use context/region/default)
        voice: Option<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        region: Option<String>,
    },

    /// List the voice catalogue
    Voices,

    /// Classify a raw engine error message
    Classify {
        /// Error text as reported by an engine
        message: String,
        /// Engine that reported it
        #[arg(short, long, default_value = "unknown")]
        engine: String,
    },
}

fn request_context(usage: Option<String>, region: Option<String>) -> RequestContext {
    let mut context = RequestContext::new();
    if let Some(usage) = usage {
        context = context.with_usage(usage);
    }
    if let Some(region) = region {
        context = context.with_region(region);
    }
    context
}

fn build_resolver(settings: &Settings) -> Result<Arc<VoiceResolver>, Box<dyn std::error::Error>> {
    let registry = match &settings.voices_file {
        Some(path) => VoiceRegistry::from_json_file(path)?,
        None => VoiceRegistry::builtin(),
    };
    info!("Voice catalogue loaded: {} identities", registry.len());
    Ok(Arc::new(VoiceResolver::new(
        Arc::new(registry),
        settings.default_voice.clone(),
        settings.context_voices.clone(),
        settings.region_voices.clone(),
    )))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::new()?,
    };

    // RUST_LOG wins over the configured level. Logs go to stderr so stdout stays JSON.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Classify { message, engine } => {
            let classified = ErrorClassifier::new().classify(&message, &engine);
            println!("{}", serde_json::to_string_pretty(&classified)?);
        }

        Commands::Voices => {
            let resolver = build_resolver(&settings)?;
            for voice in resolver.registry().iter() {
                println!(
                    "{:<32} {:<10} {:>4.1}  {}",
                    voice.generic_id,
                    voice.display_name,
                    voice.quality_score,
                    voice
                        .backend_voice_ids
                        .iter()
                        .map(|(engine, id)| format!("{}={}", engine, id))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
        }

        Commands::Resolve {
            voice,
            context,
            region,
        } => {
            let resolver = build_resolver(&settings)?;
            let resolved =
                resolver.resolve_with_source(voice.as_deref(), &request_context(context, region));
            let engines: serde_json::Map<String, serde_json::Value> = settings
                .fallback_chain
                .iter()
                .map(|engine| {
                    (
                        engine.clone(),
                        resolver.backend_voice_id(resolved.identity, engine).into(),
                    )
                })
                .collect();
            let out = serde_json::json!({
                "generic_id": resolved.identity.generic_id,
                "display_name": resolved.identity.display_name,
                "source": resolved.source,
                "engine_voices": engines,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Status => {
            let resolver = build_resolver(&settings)?;
            let orchestrator = SynthesisOrchestrator::new(
                &settings,
                resolver,
                BackendRegistry::from_settings(&settings),
            );
            orchestrator.initialize().await;
            println!("{}", serde_json::to_string_pretty(&orchestrator.get_status())?);
        }

        Commands::Speak {
            text,
            voice,
            engine,
            retries,
            context,
            region,
            out,
        } => {
            let resolver = build_resolver(&settings)?;
            let orchestrator = SynthesisOrchestrator::new(
                &settings,
                resolver,
                BackendRegistry::from_settings(&settings),
            );
            orchestrator.initialize().await;

            let mut request =
                SynthesisRequest::new(text).with_context(request_context(context, region));
            request.voice_id = voice;
            request.preferred_engine = engine;
            request.max_retries = retries;

            let response = orchestrator.synthesize(request).await;
            let to_stdout = out.as_os_str() == "-";
            match &response.audio {
                Some(audio) if to_stdout => std::io::stdout().write_all(audio)?,
                Some(audio) => {
                    std::fs::write(&out, audio)?;
                    info!("Wrote {} bytes to {}", audio.len(), out.display());
                }
                None => warn!("No audio produced; text-only response"),
            }
            let summary = serde_json::to_string_pretty(&response)?;
            if to_stdout {
                eprintln!("{}", summary);
            } else {
                println!("{}", summary);
            }
        }
    }

    Ok(())
}
