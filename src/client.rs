//! Wiring facade for the session core.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::pipeline::RequestPipeline;
use crate::realtime::{Fanout, RealtimeChannel};
use crate::session::SessionManager;
use crate::store::{CredentialStore, EncryptedFileStore};

/// One fully wired client core: credential store, session manager, request
/// pipeline, realtime channel, and message fanout.
///
/// Construct one per process — or one per test, pointed at mock servers;
/// there is no process-global instance. Must be created inside a tokio
/// runtime so the realtime channel can spawn its supervisor.
pub struct LanewireClient {
    config: ClientConfig,
    session: Arc<SessionManager>,
    pipeline: RequestPipeline,
    fanout: Arc<Fanout>,
    channel: Arc<RealtimeChannel>,
}

impl LanewireClient {
    /// Build a client over the default encrypted on-disk credential store.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let store = Arc::new(EncryptedFileStore::new_default()?);
        Ok(Self::with_store(config, store))
    }

    /// Build a client over a caller-provided credential store (OS keychain
    /// adapter, in-memory test double, ...).
    pub fn with_store(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        let session = SessionManager::new(store, &config);
        let pipeline = RequestPipeline::new(Arc::clone(&session), &config);
        let fanout = Fanout::new();
        let channel = RealtimeChannel::new(Arc::clone(&session), Arc::clone(&fanout), &config);
        Self {
            config,
            session,
            pipeline,
            fanout,
            channel,
        }
    }

    /// Rehydrate a persisted session; opens the realtime channel when one is
    /// found.
    pub fn restore(&self) -> Result<bool> {
        self.session.restore()
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Log out and tear down the realtime channel.
    pub fn shutdown(&self) -> Result<()> {
        self.session.logout()?;
        self.channel.close();
        Ok(())
    }
}
