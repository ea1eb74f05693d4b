//! # Hub
//!
//! The two listening services wired together: `Events` (ingestion, queue,
//! broadcast, archiver) and `Clients` (id registry). Each has its own
//! lifecycle; [`Hub::stop`] stops them both and returns once every task of
//! either service has exited.
//!
//! The archiver runs under a lifecycle of its own, stopped only after every
//! ingestion handler has exited, so its final flush sees every accepted event.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use super::archiver::Archiver;
use super::event::Event;
use super::ingestion::EventsHandler;
use super::lifecycle::Lifecycle;
use super::listener::{NetworkService, ServiceError};
use super::registry::{ClientRegistry, ClientStore};
use crate::configs::config_hub::HubConfig;
use crate::storage::StorageBackend;

pub const EVENTS_SERVICE: &str = "Events";
pub const CLIENTS_SERVICE: &str = "Clients";
pub const ARCHIVER_SERVICE: &str = "Archiver";

pub struct Hub {
    events: NetworkService<EventsHandler>,
    clients: NetworkService<ClientStore>,
    archiver: Arc<Archiver>,
    archiving: Lifecycle,
}

impl Hub {
    /// Binds both services and starts the archiver.
    pub async fn start(config: &HubConfig, storage: Arc<dyn StorageBackend>) -> Result<Self, ServiceError> {
        let handler = Arc::new(EventsHandler::new(EVENTS_SERVICE, config.ingestion_settings()));
        let archiver = Arc::new(Archiver::new(handler.queue(), storage, config.archive_interval()));

        let events = NetworkService::start(
            EVENTS_SERVICE,
            &config.events_endpoint(),
            config.accept_timeout(),
            handler,
        )
        .await?;

        let store = Arc::new(ClientStore::new(CLIENTS_SERVICE, config.registration_timeout()));
        let clients = match NetworkService::start(
            CLIENTS_SERVICE,
            &config.clients_endpoint(),
            config.accept_timeout(),
            store,
        )
        .await
        {
            Ok(clients) => clients,
            Err(e) => {
                events.stop().await;
                return Err(e);
            }
        };

        let archiving = Lifecycle::new(ARCHIVER_SERVICE);
        archiving.spawn(Arc::clone(&archiver).run(archiving.token()));

        info!(
            "hub: events on {}, clients on {}",
            events.local_addr(),
            clients.local_addr()
        );
        Ok(Self {
            events,
            clients,
            archiver,
            archiving,
        })
    }

    pub fn events(&self) -> &NetworkService<EventsHandler> {
        &self.events
    }

    pub fn clients(&self) -> &NetworkService<ClientStore> {
        &self.clients
    }

    pub fn events_addr(&self) -> SocketAddr {
        self.events.local_addr()
    }

    pub fn clients_addr(&self) -> SocketAddr {
        self.clients.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.clients.handler().registry()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.events.handler().subscribe()
    }

    pub fn archiver(&self) -> &Arc<Archiver> {
        &self.archiver
    }

    /// Lifecycle of the archiver task.
    pub fn archiving(&self) -> &Lifecycle {
        &self.archiving
    }

    /// Stops both services concurrently, then the archiver once ingestion is
    /// over.
    pub async fn stop(&self) {
        let events = async {
            self.events.stop().await;
            self.archiving.stop().await;
        };
        tokio::join!(events, self.clients.stop());
        info!("hub: stopped");
    }
}
