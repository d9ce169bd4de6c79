//! Line-oriented chat client.
//!
//! Run with: cargo run -p chat-cli -- [config.toml]
//!
//! Environment:
//! - `CHAT_SYNC_USER`: user id
//! - `CHAT_SYNC_TOKEN`: bearer token
//! - `CHAT_SYNC_BACKEND`: `http` (default), `file` or `memory`
//!
//! Type `/help` for commands; any other line is sent to the current session.

use std::sync::Arc;

use anyhow::Context;
use chat_sync_core::{
    ClientConfig, ClientIdentity, Credential, SessionBackend, SessionId, SyncUpdate, ViewModel,
};
use chat_sync_session::{
    Intent, SyncOrchestrator,
    storage::{FileBackend, HttpBackend, MemoryBackend},
};
use chat_sync_transport::WsChannel;
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
/new [name]      create a session
/switch <id>     select a session
/delete <id>     delete a session
/reconnect       reconnect now
/quit            exit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Intent(Intent),
    Help,
    Quit,
    Invalid(&'static str),
}

fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Command::Intent(Intent::Send(line.to_string())));
    };

    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, a)| (n, a.trim()));
    let session = || (!arg.is_empty()).then(|| SessionId::new(arg));

    Some(match name {
        "new" => Command::Intent(Intent::NewSession((!arg.is_empty()).then(|| arg.to_string()))),
        "switch" => session().map_or(Command::Invalid("usage: /switch <id>"), |id| {
            Command::Intent(Intent::SwitchSession(id))
        }),
        "delete" => session().map_or(Command::Invalid("usage: /delete <id>"), |id| {
            Command::Intent(Intent::DeleteSession(id))
        }),
        "reconnect" => Command::Intent(Intent::Reconnect),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Invalid("unknown command, try /help"),
    })
}

async fn read_commands(intents: mpsc::Sender<Intent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse(&line) {
            Some(Command::Intent(intent)) => {
                if intents.send(intent).await.is_err() {
                    break;
                }
            }
            Some(Command::Help) => println!("{HELP}"),
            Some(Command::Invalid(usage)) => eprintln!("{usage}"),
            Some(Command::Quit) => break,
            None => {}
        }
    }
}

/// Prints transcript lines not yet shown.
#[derive(Default)]
struct Printer {
    shown: Option<(SessionId, usize)>,
}

impl Printer {
    fn render(&mut self, view: &ViewModel) {
        let Some(current) = &view.current else {
            println!("[{}] no session; /new to create one", view.connection);
            self.shown = None;
            return;
        };

        let from = match &self.shown {
            Some((id, count)) if id == current && *count <= view.transcript.len() => *count,
            _ => {
                let name = view.current_summary().map_or("?", |s| s.name.as_str());
                println!("[{}] == {name} ({current}) ==", view.connection);
                0
            }
        };
        for line in &view.transcript[from..] {
            let marker = if line.pending { " (sending)" } else { "" };
            println!("{}: {}{marker}", line.author, line.content);
        }
        if let Some(typing) = &view.typing {
            println!("  {typing}");
        }
        if view.auth_required {
            eprintln!("! credential rejected; restart with a fresh CHAT_SYNC_TOKEN");
        }
        self.shown = Some((current.clone(), view.transcript.len()));
    }
}

async fn serve<B: SessionBackend + 'static>(
    config: ClientConfig,
    identity: ClientIdentity,
    backend: Arc<B>,
) {
    let channel =
        WsChannel::new(config.stream_url.clone()).with_connect_timeout(config.collaborator_timeout());
    let mut sync = SyncOrchestrator::new(config, identity, channel, backend);
    if let Err(e) = sync.start().await {
        tracing::warn!(error = %e, "Starting offline; use /reconnect");
    }

    let mut updates = sync.subscribe();
    let printer = tokio::spawn(async move {
        let mut printer = Printer::default();
        while let Some(update) = updates.next().await {
            match update {
                SyncUpdate::View(view) => printer.render(&view),
                SyncUpdate::Notice(notice) => eprintln!("! {}", notice.message),
            }
        }
    });

    let (tx, rx) = mpsc::channel(32);
    let input = tokio::spawn(read_commands(tx));
    sync.run(rx).await;

    input.abort();
    printer.abort();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => ClientConfig::default(),
    };
    let user = std::env::var("CHAT_SYNC_USER").context("CHAT_SYNC_USER is not set")?;
    let token = std::env::var("CHAT_SYNC_TOKEN").context("CHAT_SYNC_TOKEN is not set")?;
    let identity = ClientIdentity::new(user, Credential::new(token));

    match std::env::var("CHAT_SYNC_BACKEND").as_deref() {
        Ok("memory") => serve(config, identity, Arc::new(MemoryBackend::new())).await,
        Ok("file") => {
            let dir = config.storage_dir();
            tracing::info!(dir = %dir.display(), "Using file storage");
            serve(config, identity, Arc::new(FileBackend::new(dir))).await;
        }
        _ => {
            let backend = HttpBackend::new(
                config.api_base_url.clone(),
                identity.credential.clone(),
                config.collaborator_timeout(),
            )?;
            serve(config, identity, Arc::new(backend)).await;
        }
    }
    Ok(())
}
