//! One-shot bootstrap promise.
//!
//! A context owns at most one unresolved [`BootstrapPromise`]; every caller of
//! `create_new_future` while it is pending shares it. The promise resolves
//! exactly once, on `FinishInitNotify`, with the key set accumulated during the
//! bootstrap.
//!
//! Cancellation is not offered: a half finished bootstrap leaves server side
//! state the client cannot reason about. Callers race [`BootstrapFuture::wait`]
//! against their own timeout, or use [`BootstrapFuture::wait_timeout`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::Result;
use crate::ServiceKey;
use crate::WatchError;

type Snapshot = Option<Arc<BTreeSet<ServiceKey>>>;

#[derive(Debug)]
pub(crate) struct BootstrapPromise {
    tx: watch::Sender<Snapshot>,
}

impl BootstrapPromise {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// A future that is already complete.
    pub(crate) fn resolved(snapshot: BTreeSet<ServiceKey>) -> BootstrapFuture {
        let (_tx, rx) = watch::channel(Some(Arc::new(snapshot)));
        BootstrapFuture { rx }
    }

    pub(crate) fn subscribe(&self) -> BootstrapFuture {
        BootstrapFuture {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Returns `false` if the promise had already been resolved.
    pub(crate) fn resolve(
        &self,
        snapshot: BTreeSet<ServiceKey>,
    ) -> bool {
        let snapshot = Arc::new(snapshot);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(snapshot);
            true
        })
    }
}

/// Handle on the snapshot of a pattern's first consistent view.
#[derive(Debug, Clone)]
pub struct BootstrapFuture {
    rx: watch::Receiver<Snapshot>,
}

impl BootstrapFuture {
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The snapshot if the bootstrap already finished.
    pub fn try_get(&self) -> Option<BTreeSet<ServiceKey>> {
        self.rx.borrow().as_ref().map(|snapshot| (**snapshot).clone())
    }

    /// Waits for the bootstrap to finish.
    ///
    /// # Errors
    /// [`WatchError::BootstrapAbandoned`] if the context was dropped first.
    pub async fn wait(mut self) -> Result<BTreeSet<ServiceKey>> {
        let snapshot = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| WatchError::BootstrapAbandoned)?;
        snapshot
            .as_ref()
            .map(|snapshot| (**snapshot).clone())
            .ok_or_else(|| WatchError::BootstrapAbandoned.into())
    }

    pub async fn wait_timeout(
        self,
        duration: Duration,
    ) -> Result<BTreeSet<ServiceKey>> {
        tokio::time::timeout(duration, self.wait())
            .await
            .map_err(|_| WatchError::BootstrapTimeout(duration))?
    }

    /// Always fails: an in-flight bootstrap can not be torn down.
    pub fn cancel(&self) -> Result<()> {
        Err(WatchError::BootstrapCancelUnsupported.into())
    }
}
