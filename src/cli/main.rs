use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Client;
use serde_json::{json, Value};
use std::error::Error;

#[derive(Parser)]
#[command(name = "event-realtime-cli")]
#[command(about = "Event realtime service CLI", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080", env = "EVENT_RT_ENDPOINT")]
    endpoint: String,

    /// Bearer key for the publish commands
    #[arg(long, env = "EVENT_RT_INTERNAL_KEY", hide_env_values = true)]
    internal_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoomEventKind {
    Checkin,
    Stats,
    Guest,
}

impl RoomEventKind {
    fn wire_type(self) -> &'static str {
        match self {
            RoomEventKind::Checkin => "checkin_update",
            RoomEventKind::Stats => "stats_update",
            RoomEventKind::Guest => "guest_update",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health,

    /// Show live connection statistics
    Stats,

    /// Show recent broadcasts
    History {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Inspect one connection
    Connection {
        #[arg(value_name = "CONNECTION_ID")]
        id: String,
    },

    /// Broadcast an event to a room
    BroadcastRoom {
        #[arg(value_name = "ROOM_ID")]
        room_id: String,

        #[arg(short, long, value_enum, default_value = "stats")]
        kind: RoomEventKind,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// Send an admin notification to a user
    NotifyUser {
        #[arg(value_name = "USER_ID")]
        user_id: String,

        /// JSON payload
        #[arg(short, long)]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let publish = |url: String| {
        let request = client.post(url);
        match cli.internal_key.as_deref() {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    };

    let response = match cli.command {
        Commands::Health => client.get(format!("{}/health", cli.endpoint)).send().await?,

        Commands::Stats => {
            client
                .get(format!("{}/realtime/stats", cli.endpoint))
                .send()
                .await?
        }

        Commands::History { limit } => {
            let mut url = format!("{}/realtime/history", cli.endpoint);
            if let Some(limit) = limit {
                url.push_str(&format!("?limit={}", limit));
            }
            client.get(&url).send().await?
        }

        Commands::Connection { id } => {
            client
                .get(format!("{}/realtime/connections/{}", cli.endpoint, id))
                .send()
                .await?
        }

        Commands::BroadcastRoom {
            room_id,
            kind,
            data,
        } => {
            let data: Value = serde_json::from_str(&data)?;
            publish(format!("{}/internal/rooms/{}/events", cli.endpoint, room_id))
                .json(&json!({
                    "type": kind.wire_type(),
                    "data": data,
                }))
                .send()
                .await?
        }

        Commands::NotifyUser { user_id, data } => {
            let data: Value = serde_json::from_str(&data)?;
            publish(format!("{}/internal/users/{}/events", cli.endpoint, user_id))
                .json(&json!({
                    "type": "admin_notification",
                    "data": data,
                }))
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
