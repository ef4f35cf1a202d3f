use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use roomsync::adapters::{HttpRoomDirectory, HttpRoomDirectoryConfig, StaticAuth, WsTransport, WsTransportConfig};
use roomsync::cli::{parse_command, Args, Command, HELP};
use roomsync::{
    CleanupReason, ConnectionManager, Message, MessageKind, Notice, Participant, RoomSession, SyncConfig,
};

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_message(m: &Message, local_id: &str) -> String {
    let who = if m.sender_id == local_id { "you".green().bold() } else { m.sender_id.cyan().bold() };
    let body = match &m.kind {
        MessageKind::Text { text } => text.normal(),
        MessageKind::Ai { text, .. } => text.bright_white(),
        MessageKind::File { file, caption } => {
            format!("[file {} ({} bytes)] {}", file.filename, file.size, caption.as_deref().unwrap_or("")).yellow()
        }
        MessageKind::System { text } => text.dimmed(),
    };
    let mut line = format!("{} {}: {}", format!("[{}]", m.id).dimmed(), who, body);
    if !m.reactions.is_empty() {
        let reactions: Vec<String> = m.reactions.iter().map(|(emoji, users)| format!("{emoji}{}", users.len())).collect();
        line.push_str(&format!("  {}", reactions.join(" ")));
    }
    if m.sender_id == local_id && m.readers.iter().any(|r| r.user_id != local_id) {
        line.push_str(&format!(" {}", "✓".green()));
    }
    line
}

fn render_notice(n: &Notice) -> Option<String> {
    let line = match n {
        Notice::ScrollToBottom => return None,
        Notice::ConnectionLost => "connection lost".yellow(),
        Notice::Reconnecting { attempt, delay } => {
            format!("reconnecting (attempt {attempt}, next try in {:.1}s)", delay.as_secs_f64()).yellow()
        }
        Notice::Reconnected => "reconnected".green(),
        Notice::Fatal { error } => format!("fatal: {error}; restart required").red().bold(),
        Notice::StreamingFailed { id, message } => format!("AI reply {id} failed: {message}").red(),
        Notice::DuplicateSession { device_info, ip_address, countdown } => format!(
            "signed in elsewhere ({device_info}, {ip_address}); type /continue within {}s to stay",
            countdown.as_secs()
        )
        .magenta()
        .bold(),
        Notice::ForcedLogout { reason } => format!("logged out: {reason}").red().bold(),
        Notice::SetupFailed { error } => format!("could not open room: {error}").red(),
    };
    Some(format!("{} {}", "*".bold(), line))
}

fn spawn_renderers(session: &RoomSession) {
    let local_id = session.local_user().id.clone();

    let mut messages = session.messages();
    let printed_local = local_id.clone();
    tokio::spawn(async move {
        let mut printed: HashSet<String> = HashSet::new();
        while messages.changed().await.is_ok() {
            let snapshot = messages.borrow_and_update().clone();
            for m in snapshot.iter().filter(|m| !printed.contains(&m.id)) {
                println!("{}", render_message(m, &printed_local));
            }
            printed = snapshot.into_iter().map(|m| m.id).collect();
        }
    });

    let mut streaming = session.streaming_messages();
    tokio::spawn(async move {
        while streaming.changed().await.is_ok() {
            let snapshot = streaming.borrow_and_update().clone();
            for s in snapshot.values() {
                let tail: String = s.partial_content.chars().rev().take(60).collect::<Vec<_>>().into_iter().rev().collect();
                println!("{} {}", format!("… {} is typing:", s.metadata.sender_id).dimmed(), tail.dimmed());
            }
        }
    });

    let mut notices = session.notices();
    tokio::spawn(async move {
        while let Ok(n) = notices.recv().await {
            if let Some(line) = render_notice(&n) {
                println!("{line}");
            }
        }
    });
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomsync=info")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(n) = args.page_size {
        config.timeline.page_size = n;
    }

    let auth = Arc::new(StaticAuth::for_user(&args.user, &args.token));
    let transport = Arc::new(WsTransport::new(WsTransportConfig::new(&args.server)));
    let mut directory = HttpRoomDirectoryConfig::new(&args.api);
    directory.token = Some(args.token.clone());
    let rooms = Arc::new(HttpRoomDirectory::new(directory));

    let connection = ConnectionManager::new(transport, auth.clone(), config.connection.clone(), config.auth.clone());
    let session = RoomSession::builder(connection.clone(), auth, rooms)
        .local_user(Participant { id: args.user.clone(), name: args.display_name(), is_ai: false })
        .config(config)
        .build()?;

    spawn_renderers(&session);

    println!("{} {}", "joining".dimmed(), args.room.bold());
    if let Err(e) = session.setup_room(&args.room).await {
        eprintln!("{} {e}", "error:".red().bold());
        if e.is_fatal() {
            connection.shutdown().await;
            return Err(e.into());
        }
    }
    println!("{}", "type /help for commands".dimmed());

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        let command = match parse_command(&line?) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(msg) => {
                eprintln!("{}", msg.yellow());
                continue;
            }
        };
        let outcome = match command {
            Command::Send(text) => session.send_message(&text).await.map(|_| ()),
            Command::Older => session.load_older_messages(None).await.map(|page| {
                if page.added == 0 && !page.has_more {
                    println!("{}", "no older messages".dimmed());
                }
            }),
            Command::React { message_id, emoji } => session.add_reaction(&message_id, &emoji).await,
            Command::Unreact { message_id, emoji } => session.remove_reaction(&message_id, &emoji).await,
            Command::Continue => session.confirm_continue().await.map(|kept| {
                if !kept {
                    println!("{}", "nothing to confirm".dimmed());
                }
            }),
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => break,
        };
        if let Err(e) = outcome {
            eprintln!("{} {e}", "error:".red().bold());
        }
    }

    session.cleanup(CleanupReason::Manual).await;
    connection.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomsync::model::ReadReceipt;
    use std::time::Duration;

    #[test]
    fn test_render_own_message_marks_read() {
        colored::control::set_override(false);
        let mut m = Message::text("m1", "R1", "u1", 1, "hi");
        assert_eq!(render_message(&m, "u1"), "[m1] you: hi");
        m.readers.push(ReadReceipt { user_id: "u2".into(), read_at: 5 });
        assert!(render_message(&m, "u1").ends_with('✓'));
    }

    #[test]
    fn test_render_reactions_counted() {
        colored::control::set_override(false);
        let mut m = Message::text("m1", "R1", "u2", 1, "hi");
        m.reactions.entry("👍".into()).or_default().insert("u1".into());
        assert_eq!(render_message(&m, "u1"), "[m1] u2: hi  👍1");
    }

    #[test]
    fn test_scroll_notice_not_rendered() {
        assert!(render_notice(&Notice::ScrollToBottom).is_none());
        let line = render_notice(&Notice::Reconnecting { attempt: 2, delay: Duration::from_secs(2) }).unwrap();
        assert!(line.contains("attempt 2"));
    }
}
