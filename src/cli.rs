use crate::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// List saved sessions, newest first
    List,
    /// Print the messages of a session
    Show { id: String },
    /// Delete one session
    Delete { id: String },
    /// Delete all sessions
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the HTTP chat proxy
    Serve {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
    },

    /// Interactive chat in the terminal (default)
    Chat {
        /// Resume a saved session
        #[arg(long)]
        session: Option<String>,

        /// Do not print the model's thinking in this session
        #[arg(long)]
        hide_thinking: bool,
    },

    /// List available models
    Models,

    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Store an API key for a hosted provider
    SetKey { provider: String, key: String },
}

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Option<Mode>,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Model to use (local model name or hosted model id)
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Base URL of the local Ollama server
    #[arg(long)]
    pub ollama_url: Option<String>,

    /// Context window size for local models
    #[arg(long)]
    pub num_ctx: Option<usize>,

    /// Directory for stored sessions and preferences
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Path to an alternative config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn parse() -> Self {
        <Args as Parser>::parse()
    }

    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.default_model = model.clone();
        }
        if let Some(url) = &self.ollama_url {
            config.ollama_base_url = url.clone();
        }
        if let Some(num_ctx) = self.num_ctx {
            config.num_ctx = num_ctx;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(Mode::Serve {
            listen: Some(listen),
        }) = &self.mode
        {
            config.listen = listen.clone();
        }
    }
}
