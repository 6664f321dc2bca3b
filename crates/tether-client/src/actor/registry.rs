//! Open-channel registry owned by the control loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::Channel;

/// Upper bound on a single channel close, so a stuck collaborator cannot
/// stall the control loop.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct Entry {
    channel: Arc<dyn Channel>,
    /// Cancels the background request drain, for named streams.
    drain: Option<CancellationToken>,
}

/// Channels opened through the actor, keyed by the id handed to the caller.
/// Only the control loop touches this, so it needs no locking.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    entries: HashMap<Uuid, Entry>,
}

impl ChannelRegistry {
    pub(crate) fn insert(
        &mut self,
        channel: Arc<dyn Channel>,
        drain: Option<CancellationToken>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.insert(id, Entry { channel, drain });
        id
    }

    /// Close and forget one channel. Returns `false` if it was not tracked.
    pub(crate) async fn close(&mut self, id: Uuid) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                Self::close_entry(id, entry).await;
                true
            }
            None => false,
        }
    }

    /// Close every channel and cancel every drain.
    pub(crate) async fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (id, entry) in self.entries.drain() {
            Self::close_entry(id, entry).await;
        }
        if count > 0 {
            debug!(count, "Closed all channels");
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    async fn close_entry(id: Uuid, entry: Entry) {
        match timeout(CLOSE_TIMEOUT, entry.channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(channel = %id, error = %e, "Channel close failed"),
            Err(_) => warn!(channel = %id, "Channel close timed out, dropping it"),
        }
        if let Some(drain) = entry.drain {
            drain.cancel();
        }
    }
}
