use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;

use estuary::chat::config::ClientConfig;
use estuary::chat::packet::TERMINATION_KEYWORD;
use estuary::chat::relay;
use estuary::chat::session::{ChatSession, SessionEvent};

const DEFAULT_PORT: u16 = 8226;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [command, port] if command == "serve" => serve_only(port.parse()?).await,
        [host, username, rest @ ..] if rest.len() <= 1 => {
            let port = match rest.first() {
                Some(port) => port.parse()?,
                None => DEFAULT_PORT,
            };
            run_session(host, username, port).await
        }
        _ => {
            eprintln!("usage: estuary serve <port>");
            eprintln!("       estuary <host> <username> [port]");
            std::process::exit(2);
        }
    }
}

/// Relay-only node: accept, dispatch, relay. No local user.
async fn serve_only(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(port, "starting relay node");
    let state = relay::new_state(ClientConfig::server_identity());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    relay::serve(state, port, shutdown_rx, None).await?;
    Ok(())
}

/// Interactive session: stdin lines out, chat messages to stdout.
async fn run_session(
    host: &str,
    username: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let password = loop {
        println!("Enter password (at least 8 characters):");
        match stdin.next_line().await? {
            Some(line) if line.chars().count() >= 8 => break line,
            Some(_) => println!("Too short."),
            None => return Ok(()),
        }
    };

    let (mut session, mut events) = ChatSession::start(host, username, &password, port).await?;
    info!(host, username, port, "session started");

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SessionEvent::Message(message) = event {
                println!("{}: {}", message.username, message.text);
            }
        }
    });

    while let Some(line) = stdin.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let leaving = line.trim().eq_ignore_ascii_case(TERMINATION_KEYWORD);
        if session.send(line).await.is_err() {
            break;
        }
        if leaving {
            break;
        }
    }

    if let Err(e) = session.stop().await {
        tracing::warn!("session stop: {e}");
    }
    printer.abort();
    Ok(())
}
