use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::*;

use crate::commands::CommandRouter;
use crate::rcon::events::GameEvent;
use crate::store::bans::BanStore;
use crate::store::exemptions::ExemptionStore;

pub mod commands;
pub mod config;
pub mod rcon;
pub mod rdns;
pub mod store;
pub mod structures;

/// Process-wide shared state. The stores are read-mostly and shared by every
/// connection; writers serialize through each store's own lock.
pub struct AppData {
    pub bans: Arc<BanStore>,
    pub exemptions: Arc<ExemptionStore>,
    pub router: Arc<CommandRouter>,
    pub events: broadcast::Sender<(String, GameEvent)>,
    pub shutdown_sender: mpsc::Sender<()>,
    pub shutdown_receiver: watch::Receiver<bool>,
}

impl AppData {
    pub async fn shutdown(&self) {
        if let Err(err) = self.shutdown_sender.send(()).await {
            error!("Could not shutdown app : {}", err)
        }
    }
}
