//! Console Subscriber - Plain Text Output
//!
//! Connects to an edge node's subscriber port and prints every event it
//! pushes: created users, storage stats and coordinator status. Optionally
//! lists users or creates one on connect.
//!
//! # Usage
//!
//! ```bash
//! # Watch broadcasts
//! console_subscriber
//!
//! # List users, then keep watching
//! console_subscriber --list
//!
//! # Create a user, then keep watching
//! console_subscriber --create "Ada Lovelace,ada@example.com"
//! ```

use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tierline_client::{connect, WireFormat};
use tokio::signal::unix::{signal, SignalKind};

/// Console Subscriber - displays edge events in plain text format.
#[derive(Parser, Debug)]
#[command(name = "console_subscriber")]
#[command(about = "Plain console output for Tierline edge events")]
struct Args {
    /// Edge subscriber address.
    #[arg(short, long, default_value = "127.0.0.1:3003")]
    edge: String,

    /// Wire format used by the chain (json or messagepack).
    #[arg(short, long, default_value = "messagepack")]
    format: WireFormat,

    /// Request the user list on connect.
    #[arg(short, long)]
    list: bool,

    /// Create a user on connect, given as "name,email".
    #[arg(short, long, value_name = "NAME,EMAIL")]
    create: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    name: String,
    email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbStats {
    user_count: u64,
}

#[derive(Debug, Deserialize)]
struct AppStatus {
    status: String,
    connections: usize,
}

#[derive(Debug, Deserialize)]
struct Reply {
    success: bool,
    #[serde(default)]
    users: Option<Vec<User>>,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    error: Option<String>,
}

fn format_user(user: &User) -> String {
    format!("#{} {} <{}>", user.id, user.name, user.email)
}

/// Format an event for console output.
fn format_event(event: &str, payload: &serde_json::Value) -> String {
    match event {
        "user-created" => {
            if let Ok(user) = serde_json::from_value::<User>(payload.clone()) {
                return format!("[CREATED] {}", format_user(&user));
            }
        }
        "db-stats" => {
            if let Ok(stats) = serde_json::from_value::<DbStats>(payload.clone()) {
                return format!("[STATS] {} user(s)", stats.user_count);
            }
        }
        "app-status" => {
            if let Ok(status) = serde_json::from_value::<AppStatus>(payload.clone()) {
                return format!("[STATUS] {} ({} edge connection(s))", status.status, status.connections);
            }
        }
        "users-data" | "user-created-response" => {
            if let Ok(reply) = serde_json::from_value::<Reply>(payload.clone()) {
                if !reply.success {
                    let error = reply.error.as_deref().unwrap_or("unknown error");
                    return format!("[FAILED] {event}: {error}");
                }
                if let Some(users) = reply.users {
                    let lines: Vec<String> = users.iter().map(|u| format!("  {}", format_user(u))).collect();
                    return format!("[USERS] {} user(s)\n{}", users.len(), lines.join("\n"));
                }
                if let Some(user) = reply.user {
                    return format!("[OK] created {}", format_user(&user));
                }
            }
        }
        _ => {}
    }

    // Fallback: just show the event name and raw payload
    format!("[{}] {}", event, payload)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut connection = match connect(&args.edge, "console_subscriber", args.format).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to connect to edge node: {e}");
            eprintln!("Make sure the edge node is running and --edge points at its subscriber port.");
            std::process::exit(1);
        }
    };

    if args.list {
        connection.handle.emit("get-users", json!({}));
    }
    if let Some(input) = args.create.as_deref() {
        let Some((name, email)) = input.split_once(',') else {
            eprintln!("--create expects \"name,email\"");
            std::process::exit(2);
        };
        connection
            .handle
            .emit("create-user", json!({"name": name.trim(), "email": email.trim()}));
    }

    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = tokio::signal::ctrl_c() => break,

            msg = connection.stream.next() => {
                match msg {
                    Some(msg) => {
                        let timestamp = Utc::now().format("%H:%M:%S%.3f");
                        println!("[{}] {}", timestamp, format_event(msg.event(), msg.payload()));
                    }
                    None => {
                        eprintln!("Edge node closed the connection");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
