//! # Broadcast/Batch Pipeline
//!
//! ## Broadcast
//!
//! ```text
//! targets ──filter connected──> PacketSendEvent ──> group by broadcaster ──> one call per transport
//!              │ empty: false        │ cancelled: false
//! ```
//!
//! ## Batch Compression
//!
//! ```text
//!                    ┌─ sync ──> compress inline ──> resolved promise
//! prepare(batch) ────┤
//!                    └─ async ─> CompressBatchTask ──> pool ──> pending promise
//! ```
//!
//! With no explicit choice, a batch goes to the pool only when async
//! compression is enabled and the compressor would actually compress it.

use std::sync::Arc;

use kiln_core::{CompressBatchPromise, CompressBatchTask, Compressor, TaskError, WorkerPool};

use crate::error::{ServerError, ServerResult};
use crate::event::{Cancellable, EventBus, PacketSendEvent};
use crate::protocol::{ClientboundPacket, PacketBatch};
use crate::session::{PacketBroadcaster, SessionId, SessionRegistry};

/// Sessions sharing one broadcaster.
pub struct BroadcastGroup {
    /// The shared transport.
    pub broadcaster: Arc<dyn PacketBroadcaster>,
    /// Sessions it delivers to, in target order.
    pub recipients: Vec<SessionId>,
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}

fn identity(broadcaster: &Arc<dyn PacketBroadcaster>) -> *const () {
    Arc::as_ptr(broadcaster).cast::<()>()
}

/// Partitions `recipients` by broadcaster identity.
///
/// Groups appear in the order their first recipient appears. Ids that are not
/// registered, or whose broadcaster is gone, are left out.
#[must_use]
pub fn group_by_broadcaster(registry: &SessionRegistry, recipients: &[SessionId]) -> Vec<BroadcastGroup> {
    let mut groups: Vec<BroadcastGroup> = Vec::new();
    for &id in recipients {
        let Some(broadcaster) = registry.get(id).and_then(|session| session.broadcaster()) else {
            tracing::debug!(session = %id, "Dropping recipient without a live broadcaster");
            continue;
        };
        let key = identity(&broadcaster);
        match groups.iter_mut().find(|group| std::ptr::eq(identity(&group.broadcaster), key)) {
            Some(group) => group.recipients.push(id),
            None => groups.push(BroadcastGroup {
                broadcaster,
                recipients: vec![id],
            }),
        }
    }
    groups
}

/// Sends `packets` to the connected sessions among `targets`.
///
/// Returns `Ok(false)` when no target is connected, when a handler cancels
/// the [`PacketSendEvent`], or when the handlers leave no deliverable
/// recipient. Fails only for an empty packet list.
pub fn broadcast_packets(
    registry: &SessionRegistry,
    events: &mut EventBus,
    targets: &[SessionId],
    packets: &[ClientboundPacket],
) -> ServerResult<bool> {
    if packets.is_empty() {
        return Err(ServerError::InvalidArgument(
            "cannot broadcast an empty list of packets".into(),
        ));
    }

    let recipients = registry.connected(targets);
    if recipients.is_empty() {
        return Ok(false);
    }

    let mut event = PacketSendEvent::new(recipients, packets.to_vec());
    events.call(&mut event);
    if event.is_cancelled() {
        return Ok(false);
    }
    let (recipients, packets) = event.into_parts();

    let groups = group_by_broadcaster(registry, &recipients);
    for group in &groups {
        group.broadcaster.broadcast_packets(&group.recipients, &packets);
    }

    tracing::trace!(
        groups = groups.len(),
        packets = packets.len(),
        "Packets broadcast"
    );
    Ok(!groups.is_empty())
}

/// Chooses between inline and worker compression for outgoing batches.
#[derive(Clone)]
pub struct BatchCompression {
    compressor: Arc<dyn Compressor>,
    async_enabled: bool,
}

impl BatchCompression {
    /// Creates the policy.
    #[must_use]
    pub fn new(compressor: Arc<dyn Compressor>, async_enabled: bool) -> Self {
        Self {
            compressor,
            async_enabled,
        }
    }

    /// Returns the shared compressor.
    #[must_use]
    pub fn compressor(&self) -> &Arc<dyn Compressor> {
        &self.compressor
    }

    /// Returns true if batches may be compressed on workers.
    #[must_use]
    pub const fn async_enabled(&self) -> bool {
        self.async_enabled
    }

    /// Returns true if `batch` would be compressed inline under automatic choice.
    #[must_use]
    pub fn is_sync(&self, batch: &PacketBatch) -> bool {
        !(self.async_enabled && self.compressor.will_compress(batch.buffer()))
    }

    /// Compresses `batch` and returns a promise for the result.
    ///
    /// `sync = Some(true)` forces inline compression, `Some(false)` forces the
    /// pool, `None` decides automatically. Never blocks on a worker.
    pub fn prepare(
        &self,
        pool: &mut WorkerPool,
        batch: PacketBatch,
        sync: Option<bool>,
    ) -> ServerResult<CompressBatchPromise> {
        let sync = sync.unwrap_or_else(|| self.is_sync(&batch));
        let promise = CompressBatchPromise::new();

        if sync {
            match self.compressor.compress(batch.buffer()) {
                Ok(bytes) => promise.resolve(bytes)?,
                Err(error) => promise.reject(TaskError::Compress(error))?,
            }
        } else {
            let task = CompressBatchTask::new(batch.into_buffer(), promise.clone(), Arc::clone(&self.compressor));
            let slot = pool.submit_task(Box::new(task))?;
            tracing::trace!(slot, "Batch queued for worker compression");
        }

        Ok(promise)
    }
}

impl std::fmt::Debug for BatchCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCompression")
            .field("async_enabled", &self.async_enabled)
            .finish_non_exhaustive()
    }
}
