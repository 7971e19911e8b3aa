//! Subscription registry
//!
//! Tracks which sessions receive which streams: the global advertisement and
//! scanner-state streams, connections-free updates, per-peripheral connection
//! events, and per-(address, handle) notification fan-out. Sessions are keyed
//! by id so removal is atomic across every dimension.

use std::collections::{BTreeSet, HashMap, HashSet};

use bleproxy_core::types::{ScannerMode, SessionId};

use crate::outbox::OutboxSender;

/// Per-session subscription flags and outbox
pub struct SessionEntry {
    pub outbox: OutboxSender,
    pub ads: bool,
    pub ad_flags: u32,
    pub scanner_state: bool,
    pub connections_free: bool,
    pub mode_pref: ScannerMode,
    conn_addresses: HashSet<u64>,
}

impl SessionEntry {
    fn new(outbox: OutboxSender) -> Self {
        Self {
            outbox,
            ads: false,
            ad_flags: 0,
            scanner_state: false,
            connections_free: false,
            mode_pref: ScannerMode::Passive,
            conn_addresses: HashSet::new(),
        }
    }
}

/// All subscription state, owned by the coordinator task
#[derive(Default)]
pub struct SubscriptionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    notify: HashMap<(u64, u16), BTreeSet<SessionId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: SessionId, outbox: OutboxSender) {
        self.sessions.insert(id, SessionEntry::new(outbox));
    }

    /// Remove a session from every subscription set
    pub fn remove(&mut self, id: SessionId) -> Option<SessionEntry> {
        for targets in self.notify.values_mut() {
            targets.remove(&id);
        }
        self.notify.retain(|_, targets| !targets.is_empty());
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionEntry> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(&id)
    }

    pub fn outbox(&self, id: SessionId) -> Option<&OutboxSender> {
        self.sessions.get(&id).map(|s| &s.outbox)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Advertisement stream
    // ------------------------------------------------------------------

    pub fn subscribe_ads(&mut self, id: SessionId, flags: u32) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.ads = true;
            entry.ad_flags = flags;
        }
    }

    /// Record the scan mode this session wants while subscribed
    pub fn set_mode_pref(&mut self, id: SessionId, mode: ScannerMode) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.mode_pref = mode;
        }
    }

    pub fn unsubscribe_ads(&mut self, id: SessionId) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.ads = false;
        }
    }

    pub fn any_ad_subscribers(&self) -> bool {
        self.sessions.values().any(|s| s.ads)
    }

    pub fn ad_subscribers(&self) -> impl Iterator<Item = (SessionId, &SessionEntry)> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.ads)
            .map(|(id, s)| (*id, s))
    }

    /// Union of subscriber mode preferences; active wins
    pub fn union_mode(&self) -> ScannerMode {
        if self
            .sessions
            .values()
            .any(|s| s.ads && s.mode_pref.is_active())
        {
            ScannerMode::Active
        } else {
            ScannerMode::Passive
        }
    }

    /// Drop every droppable stream the session holds (outbox overflow).
    /// Returns whether anything actually lapsed.
    pub fn drop_streams(&mut self, id: SessionId) -> bool {
        let mut lapsed = false;
        if let Some(entry) = self.sessions.get_mut(&id) {
            if entry.ads {
                entry.ads = false;
                lapsed = true;
            }
        }
        for targets in self.notify.values_mut() {
            lapsed |= targets.remove(&id);
        }
        self.notify.retain(|_, targets| !targets.is_empty());
        lapsed
    }

    // ------------------------------------------------------------------
    // Scanner state and connections-free streams
    // ------------------------------------------------------------------

    pub fn subscribe_scanner_state(&mut self, id: SessionId) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.scanner_state = true;
        }
    }

    pub fn scanner_state_subscribers(&self) -> impl Iterator<Item = &OutboxSender> {
        self.sessions
            .values()
            .filter(|s| s.scanner_state)
            .map(|s| &s.outbox)
    }

    pub fn subscribe_connections_free(&mut self, id: SessionId) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.connections_free = true;
        }
    }

    pub fn connections_free_subscribers(&self) -> impl Iterator<Item = &OutboxSender> {
        self.sessions
            .values()
            .filter(|s| s.connections_free)
            .map(|s| &s.outbox)
    }

    // ------------------------------------------------------------------
    // Per-peripheral connection events
    // ------------------------------------------------------------------

    /// A session touching a peripheral follows its connection events until
    /// the session closes
    pub fn watch_address(&mut self, id: SessionId, address: u64) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.conn_addresses.insert(address);
        }
    }

    pub fn conn_event_targets(&self, address: u64) -> Vec<SessionId> {
        let mut targets: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.conn_addresses.contains(&address))
            .map(|(id, _)| *id)
            .collect();
        targets.sort();
        targets
    }

    // ------------------------------------------------------------------
    // Notification fan-out
    // ------------------------------------------------------------------

    pub fn add_notify(&mut self, id: SessionId, address: u64, handle: u16) {
        self.notify.entry((address, handle)).or_default().insert(id);
    }

    pub fn remove_notify(&mut self, id: SessionId, address: u64, handle: u16) {
        if let Some(targets) = self.notify.get_mut(&(address, handle)) {
            targets.remove(&id);
            if targets.is_empty() {
                self.notify.remove(&(address, handle));
            }
        }
    }

    /// Sessions to receive a notification from `(address, handle)`
    pub fn notify_targets(&self, address: u64, handle: u16) -> Vec<SessionId> {
        self.notify
            .get(&(address, handle))
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop all notification routes for a peripheral (handles are
    /// invalidated on disconnect)
    pub fn clear_address_notifies(&mut self, address: u64) {
        self.notify.retain(|(a, _), _| *a != address);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
