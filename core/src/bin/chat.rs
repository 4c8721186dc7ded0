/// Terminal chat client: one session, one conversation
///
/// Usage: chat [flags] <token> <counterpart>
///        chat [flags] --as <user_id> <counterpart>   (unsigned dev token)
use colored::*;
use gigchat_core::credential::unsigned_token;
use gigchat_core::{
    ChatApi, ChatConfig, ChatEntry, ChatSession, ChatSnapshot, ConnectionState, ConversationId,
    Credential, DeliveryStatus, Page,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!("{}", "GigChat terminal client".bold());
    println!();
    println!("Usage:");
    println!("  {} [flags] <token> <counterpart>", "chat".cyan());
    println!("  {} [flags] --as <user_id> <counterpart>", "chat".cyan());
    println!();
    println!("Flags:");
    println!("  --relay <host:port>      Relay address (default 127.0.0.1:5000)");
    println!("  --api <url>              Chat API base (default http://127.0.0.1:5001)");
    println!("  --ack-timeout-ms <ms>    Send acknowledgement timeout");
    println!("  --no-reconnect           Stay disconnected after the link drops");
    println!();
    println!("While chatting:");
    println!("  {}  Page through stored history, marking it read", "/history [N] [skip]".cyan());
    println!("  {}                  Leave", "/quit".cyan());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") || args.is_empty() {
        print_usage();
        return Ok(());
    }

    let dev_user = match args.iter().position(|a| a == "--as") {
        Some(i) if i + 1 < args.len() => {
            let user = args.remove(i + 1);
            args.remove(i);
            Some(user)
        }
        Some(_) => anyhow::bail!("--as requires a user id"),
        None => None,
    };

    let (config, positionals) =
        ChatConfig::from_flags(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let (token, counterpart) = match (dev_user, positionals.as_slice()) {
        (Some(user), [counterpart]) => (unsigned_token(&user), counterpart.clone()),
        (None, [token, counterpart]) => (token.clone(), counterpart.clone()),
        _ => {
            print_usage();
            anyhow::bail!("expected a credential and a counterpart");
        }
    };
    let credential = Credential::from_token(token)?;
    let credential_user = credential.user_id().to_string();
    let api = ChatApi::new(config.api_base.clone(), credential.clone());

    let session = ChatSession::over_tcp(config);
    session.open(credential);
    println!("{} Connecting as {}...", "→".cyan().bold(), credential_user);
    session.wait_connected(Duration::from_secs(15)).await?;

    let conversation = session.start_or_join(&counterpart).await?;
    println!(
        "{} Chatting with {} {}",
        "✓".green().bold(),
        counterpart.bold(),
        format!("({})", conversation.id).dimmed()
    );

    let printer = tokio::spawn(render(session.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(rest) = line.strip_prefix("/history") {
            let mut numbers = rest.split_whitespace().map(|n| n.parse::<usize>().ok());
            let page = Page {
                limit: numbers.next().flatten().unwrap_or(20),
                skip: numbers.next().flatten().unwrap_or(0),
            };
            show_history(&api, &conversation.id, credential_user.as_str(), page).await;
            continue;
        }
        // Failures are rendered from the snapshot
        let _ = session.send(line).await;
    }

    session.close();
    printer.abort();
    Ok(())
}

/// Print entries once the relay has settled them, plus connection changes
async fn render(mut rx: watch::Receiver<ChatSnapshot>) {
    let mut printed: HashSet<String> = HashSet::new();
    let mut last_state: Option<ConnectionState> = None;

    loop {
        let snapshot = rx.borrow_and_update().clone();

        if last_state.as_ref() != Some(&snapshot.connection) {
            match &snapshot.connection {
                ConnectionState::Connected => {}
                ConnectionState::Connecting => println!("{}", "… reconnecting".yellow()),
                ConnectionState::Disconnected => println!("{}", "✗ disconnected".red()),
                ConnectionState::Error(reason) => println!("{} {}", "✗".red().bold(), reason.red()),
            }
            last_state = Some(snapshot.connection.clone());
        }

        for entry in &snapshot.messages {
            if entry.status == DeliveryStatus::Pending {
                continue;
            }
            if printed.insert(entry_key(entry)) {
                print_entry(&snapshot, entry);
            }
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn entry_key(entry: &ChatEntry) -> String {
    match (&entry.provisional, &entry.id) {
        (Some(provisional), _) => provisional.to_string(),
        (None, Some(id)) => id.to_string(),
        (None, None) => format!("{}:{}", entry.created_at.timestamp_millis(), entry.body),
    }
}

fn print_entry(snapshot: &ChatSnapshot, entry: &ChatEntry) {
    let time = entry.created_at.format("%H:%M").to_string().dimmed();
    if snapshot.is_own(entry) {
        match &entry.status {
            DeliveryStatus::Failed { reason } => println!(
                "{} {} {} {}",
                time,
                "me".green().bold(),
                entry.body.strikethrough(),
                format!("(not sent: {})", reason).red()
            ),
            _ => println!("{} {} {}", time, "me".green().bold(), entry.body),
        }
    } else {
        println!("{} {} {}", time, entry.sender_id.cyan().bold(), entry.body);
    }
}

async fn show_history(api: &ChatApi, conversation_id: &ConversationId, me: &str, page: Page) {
    match api.list_conversations().await {
        Ok(summaries) => {
            if let Some(summary) = summaries.iter().find(|s| &s.conversation.id == conversation_id) {
                println!("{}", format!("{} unread", summary.unread).dimmed());
            }
        }
        Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
    }

    let messages = match api.list_messages(conversation_id, page).await {
        Ok(messages) => messages,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return;
        }
    };
    println!("{}", format!("--- {} messages from #{} ---", messages.len(), page.skip).dimmed());
    for message in messages {
        println!(
            "{} {} {}",
            message.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            message.sender_id.bold(),
            message.body
        );
        if !message.read && message.sender_id != me {
            if let Err(e) = api.mark_read(&message.id).await {
                eprintln!("{} {}", "✗".red().bold(), e);
            }
        }
    }
}
