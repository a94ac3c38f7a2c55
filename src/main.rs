mod cli;
mod config;
mod conversation;
mod llm;
mod logging;
mod persistence;
mod server;
mod terminal;
mod types;

use crate::cli::{Args, Mode, SessionCommand};
use crate::config::Config;
use crate::llm::{ChatTransport, ProviderRegistry};
use crate::persistence::{ConversationStore, FileBlobStore, Preferences, SessionStore};
use crate::terminal::TerminalChat;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

fn build_transport(config: &Config, prefs: &Preferences) -> Result<ChatTransport> {
    let registry = ProviderRegistry::with_defaults(&config.gemini_base_url);
    let mut transport = ChatTransport::new(config.transport_config(), registry);

    // Environment first, a stored key wins
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.trim().is_empty() {
            transport = transport.with_fallback_credential("gemini", key);
        }
    }
    if let Some(key) = prefs.api_key("gemini")? {
        transport = transport.with_fallback_credential("gemini", key);
    }
    Ok(transport)
}

async fn list_models(transport: &ChatTransport, prefs: &Preferences) -> Result<()> {
    let configured = prefs.api_models()?;
    for model in transport.list_models().await {
        let marker = if !model.hosted {
            "local"
        } else if configured.contains(&model.id) {
            "hosted, key set"
        } else {
            "hosted"
        };
        println!("{:<30} {} ({})", model.id, model.name, marker);
    }
    Ok(())
}

fn manage_sessions(store: &SessionStore, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::List => {
            for session in store.list()? {
                let saved = chrono::DateTime::from_timestamp_millis(session.timestamp)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{:<20} {}  {} ({} messages)",
                    session.id,
                    saved,
                    session.title,
                    session.messages.len()
                );
            }
            println!("Storage used: {} bytes", store.usage_bytes()?);
        }
        SessionCommand::Show { id } => {
            let messages = store
                .load(&id)?
                .ok_or_else(|| anyhow::anyhow!("No session with id '{id}'"))?;
            for message in messages {
                let role = if message.is_user { "User" } else { "Assistant" };
                if let Some(thinking) = &message.thinking {
                    println!("[{role} thinking] {thinking}");
                }
                println!("{role}: {}\n", message.text);
            }
        }
        SessionCommand::Delete { id } => store.delete(&id)?,
        SessionCommand::Clear => store.clear_all()?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    args.apply_to(&mut config);

    match &args.mode {
        Some(Mode::Chat { .. }) | None => {
            let log_path = logging::setup_logging_for_chat(args.verbose);
            debug!("Logging to {}", log_path.display());
        }
        _ => logging::setup_logging(args.verbose),
    }

    let blobs = Arc::new(FileBlobStore::new(config.data_dir.clone())?);
    let prefs = Preferences::new(blobs.clone());

    match args.mode {
        Some(Mode::Serve { .. }) => {
            let transport = Arc::new(build_transport(&config, &prefs)?);
            server::run(&config.listen, transport).await
        }
        Some(Mode::Models) => list_models(&build_transport(&config, &prefs)?, &prefs).await,
        Some(Mode::Sessions { command }) => {
            let store = SessionStore::new(blobs, config.save_debounce());
            manage_sessions(&store, command)
        }
        Some(Mode::SetKey { provider, key }) => {
            prefs.set_api_key(&provider, &key)?;
            let registry = ProviderRegistry::with_defaults(&config.gemini_base_url);
            for model_id in registry.model_ids() {
                if registry
                    .resolve(model_id)
                    .is_some_and(|adapter| adapter.provider() == provider)
                {
                    prefs.add_api_model(model_id)?;
                }
            }
            println!("Stored API key for {provider}");
            Ok(())
        }
        Some(Mode::Chat {
            session,
            hide_thinking,
        }) => run_chat(&config, blobs, prefs, session, hide_thinking).await,
        None => run_chat(&config, blobs, prefs, None, false).await,
    }
}

async fn run_chat(
    config: &Config,
    blobs: Arc<FileBlobStore>,
    prefs: Preferences,
    session: Option<String>,
    hide_thinking: bool,
) -> Result<()> {
    let transport = Arc::new(build_transport(config, &prefs)?);
    let store = SessionStore::new(blobs, config.save_debounce());
    let mut events = store.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!("Store event: {:?}", event);
        }
    });
    TerminalChat::new(transport, store, prefs, config.history_window)
        .hide_thinking(hide_thinking)
        .run(session)
        .await
}
