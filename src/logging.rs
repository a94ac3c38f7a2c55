use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

/// Log to stderr (server and one-shot commands)
pub fn setup_logging(verbose_level: u8) {
    setup_logging_with_file(verbose_level, None);
}

/// Interactive chat logs to a file so log lines do not interleave with the conversation
pub fn setup_logging_for_chat(verbose_level: u8) -> PathBuf {
    let log_file_path = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("thinkchat")
        .join("chat.log");

    if let Some(parent) = log_file_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    setup_logging_with_file(verbose_level, Some(log_file_path.clone()));
    log_file_path
}

fn filter_for(verbose_level: u8) -> &'static str {
    match verbose_level {
        0 => "warn,thinkchat=info",
        1 => "info,thinkchat=debug",
        _ => "debug,thinkchat=trace",
    }
}

fn setup_logging_with_file(verbose_level: u8, log_file: Option<PathBuf>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        tracing_subscriber::EnvFilter::new(filter_for(verbose_level))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!(
                    "Warning: Could not open log file {}: {e}, falling back to stderr",
                    path.display()
                );
                None
            }
        }
    });

    match file {
        Some(file) => subscriber
            .with_writer(move || match file.try_clone() {
                Ok(file) => Box::new(file) as Box<dyn io::Write + Send>,
                Err(_) => Box::new(io::sink()),
            })
            .init(),
        None => subscriber.with_writer(io::stderr).init(),
    }
}
