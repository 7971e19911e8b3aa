//! Scan lifecycle and restart policy
//!
//! A thin policy layer over the adapter: the coordinator asks for the scan
//! it wants and the scanner keeps the radio matching that intent, retrying
//! failed starts with exponential back-off.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use bleproxy_core::types::{ScannerMode, ScannerState};

use crate::adapter::BleAdapter;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Tracks scan intent and drives the adapter toward it
pub struct Scanner {
    adapter: Arc<dyn BleAdapter>,
    state: ScannerState,
    mode: ScannerMode,
    want_running: bool,
    backoff: Duration,
    next_retry: Option<Instant>,
}

impl Scanner {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        Self {
            adapter,
            state: ScannerState::Idle,
            mode: ScannerMode::Passive,
            want_running: false,
            backoff: INITIAL_BACKOFF,
            next_retry: None,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn mode(&self) -> ScannerMode {
        self.mode
    }

    /// Begin (or retune) scanning. Returns the resulting state.
    pub async fn start(&mut self, mode: ScannerMode) -> ScannerState {
        self.want_running = true;

        if self.state == ScannerState::Running && self.mode == mode {
            return self.state;
        }
        if self.state == ScannerState::Running {
            // Mode change requires a stop/start cycle on every host stack.
            let _ = self.adapter.stop_scan().await;
            self.state = ScannerState::Idle;
        }

        self.mode = mode;
        match self.adapter.start_scan(mode.is_active()).await {
            Ok(()) => {
                info!(?mode, "scan started");
                self.state = ScannerState::Running;
                self.backoff = INITIAL_BACKOFF;
                self.next_retry = None;
            }
            Err(e) => {
                warn!(error = %e, "scan start failed, scheduling retry");
                self.note_failure();
            }
        }
        self.state
    }

    /// Stop scanning and clear the running intent
    pub async fn stop(&mut self) -> ScannerState {
        self.want_running = false;
        self.next_retry = None;
        if self.state == ScannerState::Running {
            let _ = self.adapter.stop_scan().await;
            info!("scan stopped");
        }
        self.state = ScannerState::Idle;
        self.state
    }

    /// Record an asynchronous scan failure reported by the adapter
    pub fn note_failure(&mut self) {
        self.state = ScannerState::Failed;
        if self.want_running {
            self.next_retry = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Retry a failed scan once its back-off has elapsed.
    /// Returns `Some(state)` when a retry ran and the state may have changed.
    pub async fn poll_retry(&mut self) -> Option<ScannerState> {
        let due = self
            .next_retry
            .is_some_and(|at| Instant::now() >= at);
        if !(due && self.want_running && self.state == ScannerState::Failed) {
            return None;
        }
        self.next_retry = None;
        match self.adapter.start_scan(self.mode.is_active()).await {
            Ok(()) => {
                info!(mode = ?self.mode, "scan recovered");
                self.state = ScannerState::Running;
                self.backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!(error = %e, backoff = ?self.backoff, "scan retry failed");
                self.next_retry = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            }
        }
        Some(self.state)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;

    #[tokio::test]
    async fn start_and_stop_track_adapter_state() {
        let adapter = MockAdapter::new();
        let mut scanner = Scanner::new(adapter.clone());

        assert_eq!(scanner.start(ScannerMode::Passive).await, ScannerState::Running);
        assert_eq!(adapter.scan_active(), Some(false));

        assert_eq!(scanner.stop().await, ScannerState::Idle);
        assert_eq!(adapter.scan_active(), None);
    }

    #[tokio::test]
    async fn mode_change_restarts_the_scan() {
        let adapter = MockAdapter::new();
        let mut scanner = Scanner::new(adapter.clone());

        scanner.start(ScannerMode::Passive).await;
        scanner.start(ScannerMode::Active).await;
        assert_eq!(adapter.scan_active(), Some(true));
        assert_eq!(scanner.mode(), ScannerMode::Active);
        // Two starts, one intermediate stop.
        assert_eq!(adapter.scan_starts(), 2);
    }

    #[tokio::test]
    async fn failure_schedules_backoff_retry() {
        let adapter = MockAdapter::new();
        adapter.fail_next_scan_start();
        let mut scanner = Scanner::new(adapter.clone());

        assert_eq!(scanner.start(ScannerMode::Passive).await, ScannerState::Failed);
        assert!(scanner.next_retry.is_some());

        // Before the back-off elapses nothing happens.
        assert!(scanner.poll_retry().await.is_none());

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(scanner.poll_retry().await, Some(ScannerState::Running));
    }
}
