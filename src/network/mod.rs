//! Transport abstraction of the fuzzy watch subsystem.
//!
//! Byte level framing is owned by the transport implementation. The client
//! sends registrations through a [`RemoteWatchGateway`] and receives pushes
//! through its [`ServerPushSink`]; the server answers registrations and
//! streams pushes through a [`ClientPusher`].

mod loopback;
mod traced;

pub use loopback::*;
pub use traced::*;


#[cfg(test)]
use mockall::automock;
use async_trait::async_trait;

use crate::proto::AbilityKey;
use crate::proto::ServerPush;
use crate::proto::WatchRegister;
use crate::proto::WatchRegisterAck;
use crate::Result;

/// Client side view of the connection to the server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteWatchGateway: Send + Sync + 'static {
    /// Capabilities advertised by the server during connection setup.
    fn is_ability_supported(
        &self,
        ability: AbilityKey,
    ) -> bool;

    /// Sends a `WatchRegister` (or cancellation) and waits for the ack.
    ///
    /// # Errors
    /// Transport failures only; admission results travel in the ack.
    async fn fuzzy_watch(
        &self,
        request: WatchRegister,
    ) -> Result<WatchRegisterAck>;
}

/// Server side push channel to connected clients.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientPusher: Send + Sync + 'static {
    async fn push(
        &self,
        client_id: &str,
        push: ServerPush,
    ) -> Result<()>;
}

/// Receive side of server pushes on the client.
pub trait ServerPushSink: Send + Sync + 'static {
    fn on_server_push(
        &self,
        push: ServerPush,
    );
}
