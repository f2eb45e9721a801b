use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use crate::proto::AbilityKey;
use crate::proto::WatchRegister;
use crate::proto::WatchRegisterAck;
use crate::utils::scoped_timer::ScopedTimer;
use crate::RemoteWatchGateway;
use crate::Result;

/// Logs every registration round trip of the wrapped gateway.
#[derive(Debug)]
pub struct TracedGateway<G> {
    inner: G,
}

impl<G> TracedGateway<G>
where
    G: RemoteWatchGateway,
{
    pub fn new(inner: G) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G> RemoteWatchGateway for TracedGateway<G>
where
    G: RemoteWatchGateway,
{
    fn is_ability_supported(
        &self,
        ability: AbilityKey,
    ) -> bool {
        let supported = self.inner.is_ability_supported(ability);
        debug!(?ability, supported, "ability check");
        supported
    }

    async fn fuzzy_watch(
        &self,
        request: WatchRegister,
    ) -> Result<WatchRegisterAck> {
        let _timer = ScopedTimer::new("fuzzy_watch");
        let pattern = request.pattern.to_string();
        let watch_type = request.watch_type;
        let received = request.received_keys.len();

        debug!(pattern = %pattern, ?watch_type, received, "[fuzzy-watch] request");
        let result = self.inner.fuzzy_watch(request).await;
        match &result {
            Ok(ack) => match ack.error {
                Some(code) => debug!(pattern = %pattern, code = code.code(), "[fuzzy-watch] ack with error"),
                None => debug!(pattern = %pattern, "[fuzzy-watch] ack"),
            },
            Err(e) => warn!(pattern = %pattern, "[fuzzy-watch] request failed: {}", e),
        }
        result
    }
}
