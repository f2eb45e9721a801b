//! In-process transport joining client registries to a push service.
//!
//! Used for embedded deployments and end to end tests.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::proto::AbilityKey;
use crate::proto::FuzzyWatchErrorCode;
use crate::proto::ServerPush;
use crate::proto::WatchRegister;
use crate::proto::WatchRegisterAck;
use crate::ClientPusher;
use crate::FuzzyWatchPushService;
use crate::NetworkError;
use crate::RemoteWatchGateway;
use crate::Result;
use crate::ServerPushSink;

pub struct LoopbackGateway {
    client_id: String,
    service: Arc<FuzzyWatchPushService>,
    fuzzy_watch_supported: bool,
}

impl fmt::Debug for LoopbackGateway {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LoopbackGateway")
            .field("client_id", &self.client_id)
            .field("fuzzy_watch_supported", &self.fuzzy_watch_supported)
            .finish()
    }
}

impl LoopbackGateway {
    pub fn new(
        client_id: impl Into<String>,
        service: Arc<FuzzyWatchPushService>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            service,
            fuzzy_watch_supported: true,
        }
    }

    /// Simulates a server that does not advertise fuzzy watch.
    pub fn without_fuzzy_watch(mut self) -> Self {
        self.fuzzy_watch_supported = false;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl RemoteWatchGateway for LoopbackGateway {
    fn is_ability_supported(
        &self,
        ability: AbilityKey,
    ) -> bool {
        match ability {
            AbilityKey::ServerFuzzyWatch => self.fuzzy_watch_supported,
        }
    }

    async fn fuzzy_watch(
        &self,
        request: WatchRegister,
    ) -> Result<WatchRegisterAck> {
        if !self.fuzzy_watch_supported {
            return Ok(WatchRegisterAck::error(FuzzyWatchErrorCode::Unsupported));
        }
        Ok(self.service.handle_register(&self.client_id, request))
    }
}

/// Routes pushes to connected client sinks by client id.
#[derive(Default)]
pub struct LoopbackPusher {
    sinks: DashMap<String, Weak<dyn ServerPushSink>>,
}

impl fmt::Debug for LoopbackPusher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LoopbackPusher")
            .field("clients", &self.sinks.len())
            .finish()
    }
}

impl LoopbackPusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<S>(
        &self,
        client_id: impl Into<String>,
        sink: &Arc<S>,
    ) where
        S: ServerPushSink,
    {
        let client_id = client_id.into();
        let sink: Weak<S> = Arc::downgrade(sink);
        let sink: Weak<dyn ServerPushSink> = sink;
        debug!(client_id = %client_id, "loopback client connected");
        self.sinks.insert(client_id, sink);
    }

    pub fn disconnect(
        &self,
        client_id: &str,
    ) -> bool {
        let removed = self.sinks.remove(client_id).is_some();
        if removed {
            debug!(client_id = %client_id, "loopback client disconnected");
        }
        removed
    }

    pub fn is_connected(
        &self,
        client_id: &str,
    ) -> bool {
        self.sinks
            .get(client_id)
            .map(|e| e.value().strong_count() > 0)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ClientPusher for LoopbackPusher {
    async fn push(
        &self,
        client_id: &str,
        push: ServerPush,
    ) -> Result<()> {
        let sink = self.sinks.get(client_id).and_then(|e| e.value().upgrade());
        match sink {
            Some(sink) => {
                sink.on_server_push(push);
                Ok(())
            }
            None => Err(NetworkError::ClientNotConnected(client_id.to_string()).into()),
        }
    }
}
