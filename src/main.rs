use std::collections::HashMap;
use std::env::var;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use futures::join;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch::Sender;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::*;
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

use overseer::commands::{CommandRouter, HelpCommand};
use overseer::config::{self, ConnectionConfig};
use overseer::store::bans::BanStore;
use overseer::store::exemptions::ExemptionStore;
use overseer::{rcon, AppData};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_logs(cfg.log_level.as_deref());
    let uuid = Uuid::new_v4();
    info!("Starting overseer : BotId({}), {} connection(s)", uuid, cfg.connections.len());

    let bans = Arc::new(BanStore::open(&cfg.bans_file).await?);
    let exemptions = Arc::new(ExemptionStore::open(&cfg.exemptions_file).await?);

    let mut router = CommandRouter::new(cfg.commands.access_overrides.clone());
    router.register(&["help", "commands"], 0, Arc::new(HelpCommand));
    let router = Arc::new(router);

    let (events, _) = broadcast::channel(256);

    let (shutdown_task, shutdown_sender, shutdown_receiver) = shutdown();

    let data = Arc::new(AppData {
        bans,
        exemptions,
        router,
        events,
        shutdown_sender,
        shutdown_receiver: shutdown_receiver.clone(),
    });

    let mut rehash_senders = HashMap::new();
    let mut tasks = Vec::new();
    for connection in &cfg.connections {
        let (cfg_tx, cfg_rx) = watch::channel(connection.clone());
        rehash_senders.insert(connection.name.clone(), cfg_tx);
        tasks.push(tokio::spawn(rcon::run_task(
            cfg_rx,
            data.clone(),
            shutdown_receiver.clone(),
        )));
    }

    let rehash = rehash_task(rehash_senders, shutdown_receiver);

    join!(shutdown_task, rehash, join_all(tasks));

    Ok(())
}

fn init_logs(config_level: Option<&str>) {
    let filter = var("LOG_LEVEL")
        .ok()
        .or_else(|| config_level.map(|l| l.to_string()))
        .unwrap_or_else(|| "trust_dns_resolver=warn,trust_dns_proto=warn,info".to_string());
    tracing_log::LogTracer::init().ok();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();
}

/// Reloads the configuration file on SIGHUP and hands each connection its
/// new section; the connection itself decides whether that means reconnect.
async fn rehash_task(
    senders: HashMap<String, watch::Sender<ConnectionConfig>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hangup = match signal::unix::signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(err) => {
            warn!("Rehash unavailable : {}", err);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Rehashing configuration");
                let cfg = match config::load() {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("Rehash failed, keeping the old configuration : {}", err);
                        continue;
                    }
                };
                for connection in cfg.connections {
                    match senders.get(&connection.name) {
                        Some(sender) => {
                            sender.send_replace(connection);
                        }
                        None => warn!(
                            "Connection {} was added after startup, restart to pick it up",
                            connection.name
                        ),
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

fn shutdown() -> (impl Future<Output = ()>, mpsc::Sender<()>, watch::Receiver<bool>) {
    let (s, r) = tokio::sync::mpsc::channel(1);
    let (s2, r2) = tokio::sync::watch::channel(false);
    (shutdown_task(r, s2), s, r2)
}

async fn shutdown_task(mut r: Receiver<()>, s: Sender<bool>) {
    let mut terminate = match signal::unix::signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            error!("Could not register signal handler : {}", err);
            return;
        }
    };
    tokio::select! {
        _ = terminate.recv() => {
            info!("Shutdown signal received");
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown requested");
        },
        _ = r.recv() => {
            info!("Shutdown requested by inner component");
        },
    }

    s.send_replace(true);
}
