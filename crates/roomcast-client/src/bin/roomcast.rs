//! Terminal chat client for Roomcast.
//!
//! ```bash
//! roomcast ws://127.0.0.1:8080/ws alice-token
//! ROOMCAST_TOKEN=alice-token roomcast
//! ```
//!
//! Commands: `/join <room>`, `/leave`, `/quit`. Any other line is posted to
//! the joined room.

use anyhow::{Context, Result};
use roomcast_client::{ClientError, ClientEvent, ClientSession, JoinFailure, LeaveCause, DEFAULT_JOIN_TIMEOUT};
use roomcast_transport::{Connection, WebSocketConnection};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let url = args
        .get(1)
        .cloned()
        .or_else(|| std::env::var("ROOMCAST_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    let token = args
        .get(2)
        .cloned()
        .or_else(|| std::env::var("ROOMCAST_TOKEN").ok())
        .context("No token given: pass it as the second argument or set ROOMCAST_TOKEN")?;

    let conn = WebSocketConnection::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    let mut session = ClientSession::connect(conn, &token, DEFAULT_JOIN_TIMEOUT)
        .await
        .context("Handshake failed")?;

    println!(
        "Connected as {} ({}). Commands: /join <room>, /leave, /quit",
        session.info().username,
        session.info().user_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&mut session, line.trim()).await? {
                    break;
                }
            }
            event = session.next_event() => {
                match event? {
                    Some(event) => print_event(&event),
                    None => {
                        println!("Server closed the connection");
                        return Ok(());
                    }
                }
            }
        }
    }

    session.close().await?;
    Ok(())
}

/// Run one input line. Returns `false` to quit.
async fn run_command<C: Connection>(session: &mut ClientSession<C>, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }

    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return Ok(false),
        ("/leave", _) => session.leave().await?,
        ("/join", room) if !room.trim().is_empty() => {
            println!("Joining {}...", room.trim());
            session.join(room.trim()).await?;
        }
        ("/join", _) => println!("Usage: /join <room>"),
        _ => match session.post(line).await {
            Err(ClientError::NotJoined) => println!("Join a room first: /join <room>"),
            result => result?,
        },
    }
    Ok(true)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Entered {
            name, active_users, ..
        } => println!("== Joined {name} ({active_users} online)"),
        ClientEvent::JoinFailed { room_id, failure } => match failure {
            JoinFailure::Timeout => println!("!! Failed to join {room_id}. Please try again."),
            JoinFailure::Rejected { message, .. } => println!("!! {message}"),
        },
        ClientEvent::Left { room_id, cause } => match cause {
            LeaveCause::Requested => println!("== Left {room_id}"),
            LeaveCause::RoomDeleted { reason } => println!("!! Room deleted: {reason}"),
            LeaveCause::Evicted { reason } => println!("!! Removed from {room_id}: {reason}"),
        },
        ClientEvent::UserJoined { username, .. } => println!("-> {username} joined"),
        ClientEvent::UserLeft { username, .. } => println!("<- {username} left"),
        ClientEvent::Message { username, text, .. } => println!("[{username}] {text}"),
        ClientEvent::RequestFailed { message, .. } => println!("!! {message}"),
        ClientEvent::RoomViewCleared { .. } | ClientEvent::InputEnabled => {}
    }
}
