use clap::{Parser, ValueEnum};
use orrery::application::engine::{CancelToken, ChatEngine, EngineSettings};
use orrery::application::stdio;
use orrery::application::tooling::SessionPool;
use orrery::config::AppConfig;
use orrery::infrastructure::model::OpenAiClient;
use orrery::memory::{MemoryStore, SummaryScheduler};
use serde_json::json;
use std::error::Error;
use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "orrery",
    version,
    about = "Tool-using chat agent over MCP servers"
)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    incognito: bool,
    #[arg(long)]
    prompt_file: Option<String>,
    #[arg(long, value_enum, default_value_t = RunMode::Cli)]
    mode: RunMode,
    prompt: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunMode {
    Cli,
    Stdio,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    info!("Starting orrery");
    let cli = Cli::parse();
    debug!(?cli.mode, config = ?cli.config, conversation = ?cli.conversation, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration using default path or defaults");
    }

    let model = Arc::new(OpenAiClient::new(&config.model));
    let pool = SessionPool::from_registry(
        &config.servers,
        config.engine.handshake_timeout,
        config.engine.invoke_timeout,
    )
    .await;
    info!(tools = pool.list_tools().len(), "Tool namespace assembled");

    let memory = if config.memory.enabled {
        match MemoryStore::open(&config.memory.db_path) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(%err, "Memory store unavailable; conversations will not persist");
                None
            }
        }
    } else {
        None
    };

    let scheduler = match (&memory, config.memory.summary_enabled) {
        (Some(store), true) => Some(
            SummaryScheduler::new(
                Arc::clone(store),
                model.clone(),
                config.memory.summary_interval,
                config.memory.summary_max_tokens,
            )
            .spawn(),
        ),
        _ => None,
    };

    let engine = Arc::new(ChatEngine::new(
        model,
        Arc::clone(&pool),
        memory.clone(),
        EngineSettings::from_config(&config),
    ));

    info!(mode = ?cli.mode, "Running in selected mode");
    let run_result = match cli.mode {
        RunMode::Cli => run_cli(&cli, &config, &engine).await,
        RunMode::Stdio => {
            info!("Entering STDIO mode; awaiting JSON line input");
            stdio::run(Arc::clone(&engine)).await.map_err(Into::into)
        }
    };

    pool.close_all().await;
    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    info!("Shutdown complete");
    run_result
}

async fn run_cli(
    cli: &Cli,
    config: &AppConfig,
    engine: &Arc<ChatEngine>,
) -> Result<(), Box<dyn Error>> {
    let prompt = load_prompt(cli)?;
    let conversation_id = match &cli.conversation {
        Some(id) => {
            engine.load_conversation(id)?;
            id.clone()
        }
        None => engine.start_conversation(cli.incognito || config.memory.default_incognito),
    };

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling the current request");
            interrupt.cancel();
        }
    });

    info!(conversation = %conversation_id, "Dispatching prompt");
    let outcome = engine
        .handle_user_message(&conversation_id, &prompt, &cancel)
        .await?;

    let output = json!({
        "conversation_id": outcome.conversation_id,
        "content": outcome.content,
        "status": outcome.status.as_str(),
        "steps": outcome.steps,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}

fn load_prompt(cli: &Cli) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.prompt_file {
        info!(path = %path, "Loading prompt from file");
        let content = fs::read_to_string(path)?;
        return Ok(normalize_prompt(content));
    }

    if !cli.prompt.is_empty() {
        info!("Using prompt provided through CLI arguments");
        let joined = cli.prompt.join(" ");
        return Ok(normalize_prompt(joined));
    }

    if !io::stdin().is_terminal() {
        info!("Reading prompt from standard input");
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        return Ok(normalize_prompt(buffer));
    }

    warn!("Prompt not provided via arguments, file, or stdin");
    Err("prompt required via arguments, file, or stdin".into())
}

fn normalize_prompt(prompt: String) -> String {
    prompt.trim().to_string()
}
