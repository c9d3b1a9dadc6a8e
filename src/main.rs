use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whisper_gateway::config::EngineKind;
use whisper_gateway::diarize::{CommandDiarizer, Diarizer};
use whisper_gateway::engine::{Transcriber, WhisperCli};
use whisper_gateway::logging::GatewayLogFormatter;
use whisper_gateway::models::{catalog, ModelStore};
use whisper_gateway::staging::UploadStaging;
use whisper_gateway::{build_router, AppState, Config, ConfigManager, TranscriptionPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().event_format(GatewayLogFormatter::new()))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|arg| arg == "--list-models") {
        print_model_table();
        return Ok(());
    }

    info!("🚀 whisper-gateway {} starting up!", env!("CARGO_PKG_VERSION"));
    info!("{}", "=".repeat(50));

    let config_manager = ConfigManager::load()?;
    config_manager.start_watching();
    config_manager.spawn_restart_notifier();
    let config = config_manager.get();
    info!("✅ Configuration loaded");
    info!("   Device: {}", config.device.as_str());
    info!("   Compute type: {}", config.compute_type);
    info!("   Default model: {}", config.default_model);
    info!("   Max upload: {} MB", config.max_upload_mb);

    let store = Arc::new(ModelStore::new(
        config.resolved_models_dir(),
        config.model_base_url.clone(),
        config.auto_download_models,
    )?);

    let transcriber = build_transcriber(&config, store)?;
    let diarizer = build_diarizer(&config);
    let pipeline = TranscriptionPipeline::new(transcriber, diarizer);

    let staging = UploadStaging::new(config.resolved_upload_dir())?;
    info!("   Uploads: {:?}", staging.root());

    let router = build_router(AppState::new(config_manager, pipeline, staging));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎧 Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("🛑 Shutting down whisper-gateway...");
    info!("✅ Shutdown complete");

    Ok(())
}

fn build_transcriber(config: &Config, store: Arc<ModelStore>) -> Result<Arc<dyn Transcriber>> {
    match config.engine {
        EngineKind::Cli => {
            let cli = WhisperCli::new(
                config.resolved_whisper_binary(),
                store,
                config.inference_settings(),
                config.vad_options(),
            );
            cli.initialize()?;
            Ok(Arc::new(cli))
        }
        #[cfg(feature = "whisper-native")]
        EngineKind::Native => {
            let native =
                whisper_gateway::engine::NativeWhisper::new(store, config.inference_settings());
            native.initialize()?;
            Ok(Arc::new(native))
        }
        #[cfg(not(feature = "whisper-native"))]
        EngineKind::Native => {
            drop(store);
            anyhow::bail!("ENGINE=native requires a build with the 'whisper-native' feature")
        }
    }
}

fn build_diarizer(config: &Config) -> Option<Arc<dyn Diarizer>> {
    match &config.diarization.command {
        Some(command) => {
            let diarizer = CommandDiarizer::new(command.clone(), config.diarization.args.clone());
            diarizer.initialize();
            Some(Arc::new(diarizer))
        }
        None => {
            info!("   Diarization: disabled (set DIARIZE_COMMAND to enable)");
            None
        }
    }
}

fn print_model_table() {
    let catalog = catalog(Config::default().default_model);

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Model", "Parameters", "Memory", "Description"]);

    for model in &catalog.models {
        let name = if model.name == catalog.default {
            format!("{} (default)", model.name)
        } else {
            model.name.to_string()
        };
        table.add_row(vec![
            name,
            model.params.to_string(),
            model.memory.to_string(),
            model.description.to_string(),
        ]);
    }

    println!("{table}");
    println!("Recommended for CPU: {}. {}.", catalog.recommended_for_cpu, catalog.note);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to set up SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
