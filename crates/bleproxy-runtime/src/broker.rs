//! GATT operation broker
//!
//! Correlates control-side requests with BLE-side completions. Every request
//! gets a monotonic op id, the originating session, and a deadline; an op is
//! resolved exactly once. Completions for unknown op ids (late results after
//! a timeout or a pre-empting disconnect) are discarded by construction.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use bleproxy_ble::GattOpKind;
use bleproxy_core::types::SessionId;

/// One in-flight operation
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub op_id: u64,
    pub address: u64,
    pub handle: u16,
    pub kind: GattOpKind,
    pub origin: SessionId,
    pub deadline: Instant,
}

/// Pending-operation table
pub struct OpBroker {
    pending: HashMap<u64, PendingOp>,
    next_op_id: u64,
    op_timeout: Duration,
}

impl OpBroker {
    pub fn new(op_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            next_op_id: 1,
            op_timeout,
        }
    }

    /// Admit a new operation and return its id
    pub fn begin(
        &mut self,
        address: u64,
        handle: u16,
        kind: GattOpKind,
        origin: SessionId,
    ) -> u64 {
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        self.pending.insert(
            op_id,
            PendingOp {
                op_id,
                address,
                handle,
                kind,
                origin,
                deadline: Instant::now() + self.op_timeout,
            },
        );
        op_id
    }

    /// First resolution wins; anything later gets `None` and is dropped
    pub fn resolve(&mut self, op_id: u64) -> Option<PendingOp> {
        self.pending.remove(&op_id)
    }

    /// Remove and return every op past its deadline
    pub fn expire(&mut self, now: Instant) -> Vec<PendingOp> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Remove and return every op targeting `address` (disconnect pre-empts
    /// queued work)
    pub fn drain_address(&mut self, address: u64) -> Vec<PendingOp> {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, op)| op.address == address)
            .map(|(id, _)| *id)
            .collect();
        let mut drained: Vec<PendingOp> = ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        drained.sort_by_key(|op| op.op_id);
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
