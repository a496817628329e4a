//! Root composition of the sync client.
//!
//! [`ShipClient`] owns the one cache, the one realtime service and the
//! notification channel, and hands out mutation controllers wired to them.

use ship_cache::{CacheConfig, QueryCache, QueryFetcher};
use ship_core::{ProjectId, UserId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::api_client::{MessageApi, RestClient, SaveApi, VoteApi};
use crate::config::ShipConfig;
use crate::error::ClientError;
use crate::mutation::{MessageSendController, SaveController, VoteController};
use crate::notifications::{Notification, NotificationAction, Notifier};
use crate::persistence::CredentialStore;
use crate::prefetch::{warm_up, WarmupReport};
use crate::realtime::{ConnectionHandle, ConnectionState, RealtimeService, RealtimeSettings};
use crate::routes::RestFetcher;
use crate::socketio::{Connector, SocketIoConnector};
use crate::sync::register_domain_handlers;

/// The server-facing seams the client is assembled from.
#[derive(Clone)]
pub struct Backends {
    pub fetcher: Arc<dyn QueryFetcher>,
    pub votes: Arc<dyn VoteApi>,
    pub messages: Arc<dyn MessageApi>,
    pub saves: Arc<dyn SaveApi>,
    pub connector: Arc<dyn Connector>,
}

impl Backends {
    /// REST for queries and mutations, Socket.IO for events.
    pub fn network(config: &ShipConfig, credentials: Arc<CredentialStore>) -> Result<Self, ClientError> {
        let rest = Arc::new(RestClient::new(config, credentials)?);
        let connector = SocketIoConnector::new(config.request_timeout())
            .map_err(crate::realtime::RealtimeError::from)?;
        Ok(Self {
            fetcher: Arc::new(RestFetcher::new(RestClient::clone(&rest))),
            votes: rest.clone(),
            messages: rest.clone(),
            saves: rest,
            connector: Arc::new(connector),
        })
    }
}

#[derive(Debug)]
pub struct StartReport {
    pub warmup: WarmupReport,
    pub connection: ConnectionHandle,
    /// False if handlers were already registered on this connection.
    pub handlers_registered: bool,
}

pub struct ShipClient {
    config: ShipConfig,
    credentials: Arc<CredentialStore>,
    backends: Backends,
    cache: QueryCache,
    realtime: RealtimeService,
    notifier: Notifier,
}

impl ShipClient {
    /// Build the client against the live backend.
    pub fn new(config: ShipConfig) -> Result<(Self, mpsc::Receiver<Notification>), ClientError> {
        let credentials = Arc::new(CredentialStore::open(&config.credentials_path)?);
        let backends = Backends::network(&config, Arc::clone(&credentials))?;
        Ok(Self::from_parts(config, credentials, backends))
    }

    pub fn from_parts(
        config: ShipConfig,
        credentials: Arc<CredentialStore>,
        backends: Backends,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let cache_config = CacheConfig::new().with_stale_time(config.cache.default_stale());
        let cache = QueryCache::with_fetcher(cache_config, Arc::clone(&backends.fetcher));
        let realtime = RealtimeService::new(
            Arc::clone(&backends.connector),
            RealtimeSettings::from_config(&config),
        );
        let (notifier, rx) = Notifier::channel(config.notifications.capacity);
        let client = Self {
            config,
            credentials,
            backends,
            cache,
            realtime,
            notifier,
        };
        (client, rx)
    }

    pub fn config(&self) -> &ShipConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn realtime(&self) -> &RealtimeService {
        &self.realtime
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Warm the cache, open the event stream and attach the sync handlers.
    pub async fn start(&self) -> Result<StartReport, ClientError> {
        let authenticated = self.credentials.is_authenticated();
        let warmup = warm_up(&self.cache, authenticated, &self.config.prefetch).await;
        let connection = self.realtime.connect(&self.config.socket_url)?;
        let handlers_registered = register_domain_handlers(&connection, &self.cache, &self.notifier)?;
        if handlers_registered {
            tokio::spawn(notify_on_failure(
                connection.watch_state(),
                self.notifier.clone(),
            ));
        }
        info!(
            authenticated,
            warmed = warmup.succeeded,
            url = connection.url(),
            "Sync client started"
        );
        Ok(StartReport {
            warmup,
            connection,
            handlers_registered,
        })
    }

    pub fn vote_controller(&self, project_id: ProjectId) -> VoteController {
        VoteController::from_cache(
            project_id,
            Arc::clone(&self.backends.votes),
            self.cache.clone(),
            self.notifier.clone(),
        )
    }

    pub fn message_controller(&self, recipient: UserId) -> MessageSendController {
        MessageSendController::new(
            recipient,
            Arc::clone(&self.backends.messages),
            self.cache.clone(),
            self.notifier.clone(),
        )
    }

    pub fn save_controller(&self, project_id: ProjectId) -> SaveController {
        SaveController::new(
            project_id,
            Arc::clone(&self.backends.saves),
            self.cache.clone(),
            self.notifier.clone(),
        )
    }

    /// Replace the current event stream with a fresh connection.
    ///
    /// This is the answer to a [`NotificationAction::Reconnect`] after the
    /// stream gave up.
    pub async fn reconnect(&self) -> Result<StartReport, ClientError> {
        self.realtime.teardown().await;
        self.start().await
    }

    /// Close the event stream. The cache is kept.
    pub async fn shutdown(&self) {
        self.realtime.teardown().await;
        info!("Sync client stopped");
    }
}

/// Tell the user once the event stream has stopped retrying.
async fn notify_on_failure(mut state: watch::Receiver<ConnectionState>, notifier: Notifier) {
    if state.wait_for(|s| *s == ConnectionState::Failed).await.is_ok() {
        notifier.notify(
            Notification::warning("Live updates paused")
                .with_description("Could not reach the realtime server")
                .with_action(NotificationAction::Reconnect),
        );
    }
}
