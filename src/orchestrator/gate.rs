//! Pause gate: a reusable latch every story phase transition awaits.
//!
//! Pausing only delays phases that have not started; a dispatch already in
//! flight is never interrupted.

use tokio::sync::watch;

#[derive(Clone)]
pub struct PauseGate {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes immediately when not paused; otherwise waits for
    /// `resume`.
    pub async fn wait_ready(&self) {
        let mut rx = self.rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
