//! Interactive terminal chat.

use crate::conversation::Conversation;
use crate::llm::{ChatEvent, ChatTransport, EventCallback, TurnOutcome};
use crate::persistence::{Preferences, SessionStore};
use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Incrementally prints cumulative snapshots
#[derive(Default)]
struct Renderer {
    printed_thinking: usize,
    printed_response: usize,
    show_thinking: bool,
    collapsed: bool,
    announced_thinking: bool,
}

impl Renderer {
    fn new(show_thinking: bool, collapsed: bool) -> Self {
        Self {
            show_thinking,
            collapsed,
            ..Default::default()
        }
    }

    /// Text to print for this event, given everything printed before
    fn render(&mut self, event: &ChatEvent) -> String {
        let mut out = String::new();

        if self.show_thinking {
            if let Some(new) = event.thinking.get(self.printed_thinking..) {
                if !new.is_empty() {
                    if self.collapsed {
                        if !self.announced_thinking {
                            out.push_str(&format!("{DIM}[thinking...]{RESET}\n"));
                        }
                    } else {
                        out.push_str(&format!("{DIM}{new}{RESET}"));
                    }
                    self.announced_thinking = true;
                    self.printed_thinking = event.thinking.len();
                }
            }
        }

        if let Some(new) = event.response.get(self.printed_response..) {
            if !new.is_empty() {
                if self.printed_response == 0 && self.announced_thinking && !self.collapsed {
                    out.push_str("\n\n");
                }
                out.push_str(new);
                self.printed_response = event.response.len();
            }
        }

        if let Some(error) = &event.error {
            out.push_str(&format!("\n{RED}Error: {error}{RESET}"));
        }
        if event.done {
            out.push('\n');
        }
        out
    }
}

pub struct TerminalChat {
    transport: Arc<ChatTransport>,
    store: SessionStore,
    prefs: Preferences,
    model: String,
    history_window: usize,
    /// Hide thinking for this run without touching the stored preference
    hide_thinking: bool,
}

impl TerminalChat {
    pub fn new(
        transport: Arc<ChatTransport>,
        store: SessionStore,
        prefs: Preferences,
        history_window: usize,
    ) -> Self {
        let model = transport.config().default_model.clone();
        Self {
            transport,
            store,
            prefs,
            model,
            history_window,
            hide_thinking: false,
        }
    }

    pub fn hide_thinking(mut self, hide: bool) -> Self {
        self.hide_thinking = hide;
        self
    }

    fn show_thinking(&self) -> Result<bool> {
        Ok(!self.hide_thinking && !self.prefs.hide_thinking()?)
    }

    fn api_key_for_model(&self) -> Result<Option<String>> {
        match self.transport.registry().resolve(&self.model) {
            Some(adapter) => self.prefs.api_key(adapter.provider()),
            None => Ok(None),
        }
    }

    pub async fn run(mut self, session: Option<String>) -> Result<()> {
        let mut conversation = match &session {
            Some(id) => Conversation::load(&self.store, id, self.history_window)?,
            None => Conversation::new(self.history_window),
        };

        println!("Chatting with {}. Type /help for commands, Ctrl-C cancels a response.", self.model);
        for message in conversation.messages() {
            let role = if message.is_user { "you" } else { "assistant" };
            println!("{DIM}{role}:{RESET} {}", message.text);
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read input")?,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    None
                }
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();

            match line.split_once(' ').unwrap_or((line, "")) {
                ("/quit" | "/exit", _) => break,
                ("/help", _) => {
                    println!("/model <id>  switch model");
                    println!("/hide        toggle hiding the model's thinking");
                    println!("/collapse    toggle collapsed thinking");
                    println!("/new         start a new conversation");
                    println!("/quit        leave");
                }
                ("/model", id) if !id.trim().is_empty() => {
                    self.model = id.trim().to_string();
                    println!("Using model {}", self.model);
                }
                ("/hide", _) => {
                    let hide = self.show_thinking()?;
                    self.hide_thinking = hide;
                    self.prefs.set_hide_thinking(hide)?;
                    println!("Thinking {}", if hide { "hidden" } else { "shown" });
                }
                ("/collapse", _) => {
                    let open = !self.prefs.thinking_panel_open()?;
                    self.prefs.set_thinking_panel_open(open)?;
                    println!("Thinking {}", if open { "expanded" } else { "collapsed" });
                }
                ("/new", _) => {
                    self.store.flush()?;
                    conversation = Conversation::new(self.history_window);
                    println!("Started a new conversation");
                }
                ("", _) => {}
                _ => self.run_turn(&mut conversation, line).await?,
            }
        }

        self.store.flush()?;
        if let Some(id) = conversation.session_id() {
            println!("Saved as {id}");
        }
        Ok(())
    }

    async fn run_turn(&self, conversation: &mut Conversation, text: &str) -> Result<()> {
        let request = match conversation.begin_turn(text) {
            Ok(request) => request.into_chat_request(&self.model, self.api_key_for_model()?),
            Err(e) => {
                println!("{RED}{e}{RESET}");
                return Ok(());
            }
        };
        conversation.save(&self.store)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ChatEvent>();
        let callback: EventCallback = Box::new(move |event: &ChatEvent| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("terminal closed"))
        });
        let cancel = CancellationToken::new();
        let transport = self.transport.clone();
        let turn_cancel = cancel.clone();
        let turn = tokio::spawn(async move { transport.send(&request, &turn_cancel, &callback).await });

        let mut renderer = Renderer::new(
            self.show_thinking()?,
            !self.prefs.thinking_panel_open()?,
        );
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if conversation.apply(&event) {
                        print!("{}", renderer.render(&event));
                        std::io::stdout().flush()?;
                        if let Err(e) = conversation.save(&self.store) {
                            warn!("Failed to save conversation: {:#}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    break;
                }
            }
        }

        let outcome = turn.await;
        while let Ok(event) = rx.try_recv() {
            if conversation.apply(&event) {
                print!("{}", renderer.render(&event));
            }
        }

        match outcome {
            Ok(outcome) => {
                if conversation.is_busy() {
                    // Cancelled: keep what was folded, including text never emitted
                    let partial = outcome.snapshot();
                    print!("{}", renderer.render(&ChatEvent::progress(partial, false)));
                    conversation.cancel_turn(partial);
                    println!("\n{DIM}[cancelled]{RESET}");
                }
                match outcome {
                    TurnOutcome::Failed { error, .. } => debug!("Turn failed: {}", error),
                    outcome => debug!(
                        "Turn ended with {} response bytes",
                        outcome.snapshot().response.len()
                    ),
                }
            }
            Err(e) => {
                warn!("Chat turn task failed: {}", e);
                conversation.cancel_turn(&Default::default());
            }
        }
        conversation.save(&self.store)?;
        Ok(())
    }
}
