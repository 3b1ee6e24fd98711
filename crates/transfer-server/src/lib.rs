pub mod access;
pub mod approval;
pub mod auth;
pub mod error;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod network;
pub mod server;
pub mod settings;
pub mod storage;
pub mod transfer;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub transfer: transfer::FileTransfer,
    pub settings: settings::SettingsStore,
    /// Per-address approval cache and the broker that prompts the operator.
    pub access: access::AccessControl,
}

impl AppState {
    pub fn new(
        folder: Arc<dyn storage::SharedFolder>,
        settings: settings::SettingsStore,
        access: access::AccessControl,
        notifier: events::ChangeNotifier,
        chunk_size: usize,
    ) -> Self {
        Self {
            transfer: transfer::FileTransfer::new(folder, notifier, chunk_size),
            settings,
            access,
        }
    }
}

pub use lifecycle::{Lifecycle, ServerState};
pub use server::{resolve_data_dir, router, run, ServerConfig, ServerHandle};
