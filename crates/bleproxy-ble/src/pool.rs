//! Bounded connection pool
//!
//! At most one slot per 48-bit address; occupancy is capped and a slot is
//! freed only by explicit disconnect, connect failure, or a peripheral
//! dropping the link. There is no implicit eviction.

use std::collections::HashMap;

use thiserror::Error;

use bleproxy_core::types::DeviceAddress;

use crate::connection::ConnectionChannels;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection pool is full")]
    Exhausted,
    #[error("address already occupies a slot")]
    Occupied,
}

/// Connection lifecycle as the pool sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Connecting,
    Connected { mtu: u16 },
    Disconnecting,
}

/// One occupied pool slot
pub struct ConnectionSlot {
    pub address: DeviceAddress,
    pub state: SlotState,
    pub channels: ConnectionChannels,
}

/// The bounded address-keyed slot map
pub struct ConnectionPool {
    slots: HashMap<u64, ConnectionSlot>,
    max_connections: usize,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: HashMap::new(),
            max_connections,
        }
    }

    /// Occupy a slot for `address`. Fails with [`PoolError::Occupied`] when a
    /// record already exists and [`PoolError::Exhausted`] at the cap.
    pub fn insert(
        &mut self,
        address: DeviceAddress,
        channels: ConnectionChannels,
    ) -> Result<(), PoolError> {
        if self.slots.contains_key(&address.key()) {
            return Err(PoolError::Occupied);
        }
        if self.slots.len() >= self.max_connections {
            return Err(PoolError::Exhausted);
        }
        self.slots.insert(
            address.key(),
            ConnectionSlot {
                address,
                state: SlotState::Connecting,
                channels,
            },
        );
        Ok(())
    }

    pub fn get(&self, address: u64) -> Option<&ConnectionSlot> {
        self.slots.get(&address)
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(&address)
    }

    /// Free a slot explicitly
    pub fn remove(&mut self, address: u64) -> Option<ConnectionSlot> {
        self.slots.remove(&address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.keys().copied()
    }

    pub fn occupancy(&self) -> usize {
        self.slots.len()
    }

    pub fn free(&self) -> usize {
        self.max_connections.saturating_sub(self.slots.len())
    }

    pub fn limit(&self) -> usize {
        self.max_connections
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bleproxy_core::types::AddressType;
    use tokio::sync::mpsc;

    fn dummy_channels() -> ConnectionChannels {
        let (ops_tx, _ops_rx) = mpsc::channel(1);
        let (disconnect_tx, _disconnect_rx) = mpsc::channel(1);
        ConnectionChannels {
            ops_tx,
            disconnect_tx,
        }
    }

    fn addr(n: u64) -> DeviceAddress {
        DeviceAddress::new(n, AddressType::Public)
    }

    #[test]
    fn at_most_one_slot_per_address() {
        let mut pool = ConnectionPool::new(3);
        pool.insert(addr(1), dummy_channels()).unwrap();
        assert_eq!(
            pool.insert(addr(1), dummy_channels()),
            Err(PoolError::Occupied)
        );
        assert_eq!(pool.occupancy(), 1);
    }

    #[test]
    fn cap_is_enforced_and_size_unchanged_on_rejection() {
        let mut pool = ConnectionPool::new(3);
        for n in 1..=3 {
            pool.insert(addr(n), dummy_channels()).unwrap();
        }
        assert_eq!(
            pool.insert(addr(4), dummy_channels()),
            Err(PoolError::Exhausted)
        );
        assert_eq!(pool.occupancy(), 3);
        assert_eq!(pool.free(), 0);
    }

    #[test]
    fn explicit_remove_frees_the_slot() {
        let mut pool = ConnectionPool::new(1);
        pool.insert(addr(9), dummy_channels()).unwrap();
        assert!(pool.remove(9).is_some());
        assert_eq!(pool.free(), 1);
        pool.insert(addr(10), dummy_channels()).unwrap();
    }

    #[test]
    fn slots_start_connecting() {
        let mut pool = ConnectionPool::new(1);
        pool.insert(addr(5), dummy_channels()).unwrap();
        assert_eq!(pool.get(5).unwrap().state, SlotState::Connecting);
    }
}
