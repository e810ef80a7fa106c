use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, ChatSession, ClientSettings, Notifier, OutgoingPayload, SendOutcome,
    SessionEvent,
};
use futures::StreamExt;
use shared::domain::{Identity, Role, UserId};
use storage::ChatMessage;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long, value_enum, default_value = "operative")]
    role: RoleArg,
    #[arg(long)]
    user_name: Option<String>,
    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,
    /// Seconds to wait for the realtime connection before working offline.
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Operative,
    Supervisor,
    Manager,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Operative => Role::Operative,
            RoleArg::Supervisor => Role::Supervisor,
            RoleArg::Manager => Role::Manager,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a text message, queueing it when offline.
    Send { to: String, text: String },
    /// Reconcile and print the conversation with a user.
    History { with: String },
    /// Follow a conversation until interrupted.
    Tail { with: String },
    /// Deliver whatever the outbox holds.
    Drain,
    /// Print the number of queued items.
    Pending,
    /// Print cached notifications.
    Notifications,
}

struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn play_sound(&self) {
        print!("\x07");
    }

    fn toast(&self, title: &str, body: &str) {
        println!("[{title}] {body}");
    }
}

fn apply_overrides(mut settings: ClientSettings, cli: &Cli) -> ClientSettings {
    if let Some(server_url) = &cli.server_url {
        settings.server_url = server_url.clone();
    }
    if let Some(database_url) = &cli.database_url {
        settings.database_url = database_url.clone();
    }
    settings
}

fn print_message(message: &ChatMessage) {
    let status = match (message.is_durable(), message.read) {
        (false, _) => "pending",
        (true, true) => "read",
        (true, false) => "sent",
    };
    let body = match (&message.text, &message.audio_url) {
        (Some(text), _) => text.as_str(),
        (None, Some(_)) if message.has_local_audio() => "<voice note, not uploaded>",
        (None, Some(_)) => "<voice note>",
        (None, None) => "",
    };
    println!(
        "{} {:>8} [{status}] {body}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.from_id,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = apply_overrides(load_settings(), &cli);
    let identity = Identity {
        user_id: UserId::new(&cli.user_id),
        role: cli.role.into(),
        user_name: cli.user_name.clone().unwrap_or_else(|| cli.user_id.clone()),
    };

    let session = ChatSession::connect(
        &settings,
        identity,
        cli.token.clone(),
        Arc::new(TerminalNotifier),
    )
    .await?;
    if !session
        .wait_connected(Duration::from_secs(cli.connect_timeout))
        .await
    {
        warn!(server_url = %settings.server_url, "realtime connection not up; working offline");
    }

    let result = run(&session, cli.command).await;
    session.shutdown().await;
    result
}

async fn run(session: &ChatSession, command: Command) -> Result<()> {
    match command {
        Command::Send { to, text } => {
            let view = session.open_conversation(UserId::new(&to)).await;
            match view.send(OutgoingPayload::Text(text)).await? {
                SendOutcome::Sent { client_ref } => println!("sent client_ref={client_ref}"),
                SendOutcome::Queued {
                    pending_id,
                    client_ref,
                    ..
                } => println!("queued pending_id={pending_id} client_ref={client_ref}"),
                SendOutcome::HeldInMemory { client_ref } => {
                    println!("held in memory client_ref={client_ref}")
                }
            }
        }
        Command::History { with } => {
            let mut view = session.open_conversation(UserId::new(&with)).await;
            view.reconciled().await;
            for message in view.messages().await? {
                print_message(&message);
            }
        }
        Command::Tail { with } => {
            let view = session.open_conversation(UserId::new(&with)).await;
            let mut updates = view.watch();
            let mut events = session.subscribe();
            let mut printed = 0usize;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    list = updates.next() => {
                        let Some(list) = list else { break };
                        if list.len() < printed {
                            printed = 0;
                        }
                        for message in &list[printed..] {
                            print_message(message);
                        }
                        printed = list.len();
                    }
                    event = events.recv() => match event {
                        Ok(SessionEvent::PresenceChanged { online }) => {
                            info!(online = online.len(), "presence updated");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        _ => {}
                    },
                }
            }
        }
        Command::Drain => {
            let report = session.outbox().drain().await;
            println!(
                "messages_sent={} reports_sent={} stalled={}",
                report.messages_sent, report.reports_sent, report.stalled
            );
        }
        Command::Pending => {
            println!("pending={}", session.outbox().pending_count().await?);
        }
        Command::Notifications => {
            for notification in session.notifications().await? {
                let marker = if notification.read { " " } else { "*" };
                println!(
                    "{marker} {} {}: {}",
                    notification.id, notification.title, notification.message
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
