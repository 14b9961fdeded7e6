//! CLI for delivery-feed
//!
//! Subcommands:
//! - `server`: run the update dispatcher
//! - `login` / `logout`: store or clear the dashboard's access token
//! - `watch`: follow live updates for one date
//! - `publish`: report a delivery mutation, as the backend would

use std::error::Error;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tracing::{error, info};
use tungstenite::protocol::Message as WsMessage;
use url::Url;

use delivery_feed::client::{ConnectionManager, DateSubscription};
use delivery_feed::config::{Settings, load_config};
use delivery_feed::dispatcher::Dispatcher;
use delivery_feed::persistence::{CredentialStore, SledCredentialStore};
use delivery_feed::topic::TopicDate;
use delivery_feed::transport::message::{ClientMessage, Handshake, ServerMessage, UpdatePayload};
use delivery_feed::transport::start_websocket_server;
use delivery_feed::utils::logging;

#[derive(Parser)]
#[command(name = "delivery-feed", about = "Live delivery updates for the dispatch dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the update dispatcher server
    Server,
    /// Store the access token used by `watch`
    Login {
        #[arg(long)]
        token: String,
    },
    /// Remove the stored access token
    Logout,
    /// Log every update for a date until Ctrl-C
    Watch {
        /// Date to follow (YYYY-MM-DD)
        #[arg(long)]
        date: TopicDate,
    },
    /// Publish one delivery mutation
    Publish {
        #[arg(long)]
        date: TopicDate,
        /// JSON body of the update
        #[arg(long)]
        data: String,
        /// Bearer token; defaults to the stored one
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&settings.log.level);

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Login { token } => login(&settings, &token),
        Command::Logout => logout(&settings),
        Command::Watch { date } => watch(&settings, date).await,
        Command::Publish { date, data, token } => publish(&settings, date, &data, token).await,
    };

    if let Err(e) = result {
        error!("{e}");
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn Error>> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let dispatcher = Arc::new(Mutex::new(Dispatcher::new()));

    tokio::select! {
        result = start_websocket_server(addr, dispatcher, settings) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

fn login(settings: &Settings, token: &str) -> Result<(), Box<dyn Error>> {
    let store = SledCredentialStore::open(&settings.client.credential_path)?;
    store.set(&settings.client.token_key, token)?;
    info!("access token stored");
    Ok(())
}

fn logout(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let store = SledCredentialStore::open(&settings.client.credential_path)?;
    store.remove(&settings.client.token_key)?;
    info!("access token removed");
    Ok(())
}

async fn watch(settings: &Settings, date: TopicDate) -> Result<(), Box<dyn Error>> {
    let manager = ConnectionManager::install_global(ConnectionManager::from_settings(&settings.client)?);

    let subscription = DateSubscription::for_date(manager.clone(), date, move |data: Value| {
        info!("update for {date}: {data}");
    });
    if !subscription.is_active() {
        return Err(format!("could not subscribe to {date}").into());
    }
    info!("watching {date}, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    drop(subscription);
    manager.get_connection().disconnect();
    Ok(())
}

async fn publish(
    settings: &Settings,
    date: TopicDate,
    data: &str,
    token: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let data: Value = serde_json::from_str(data)?;
    let token = match token {
        Some(token) => token,
        None => SledCredentialStore::open(&settings.client.credential_path)?
            .get(&settings.client.token_key)
            .ok_or("no token given and none stored")?,
    };

    let url = Url::parse(&settings.client.backend_url)?;
    let (mut ws_stream, _response) = connect_async(url.as_str()).await?;

    let hello = ClientMessage::Handshake(Handshake::bearer(token));
    ws_stream
        .send(WsMessage::text(serde_json::to_string(&hello)?))
        .await?;

    match ws_stream.next().await {
        Some(Ok(frame)) if frame.is_text() => match serde_json::from_str::<ServerMessage>(frame.to_text()?)? {
            ServerMessage::Connect => {}
            ServerMessage::ConnectError { message } => return Err(message.into()),
            other => return Err(format!("unexpected reply: {other:?}").into()),
        },
        _ => return Err("connection closed during handshake".into()),
    }

    let update = ClientMessage::Publish(UpdatePayload {
        date: date.canonical(),
        data,
    });
    ws_stream
        .send(WsMessage::text(serde_json::to_string(&update)?))
        .await?;
    ws_stream.close(None).await?;

    info!("published update for {date}");
    Ok(())
}
