//! Process-level stop signal shared by a server and its connection tasks.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// A `shutdown` command finished its grace period.
    Requested,
    /// The node can no longer persist its state.
    Fatal(String),
}

#[derive(Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<Option<Exit>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self) {
        self.set(Exit::Requested);
    }

    pub fn fatal(&self, reason: impl Into<String>) {
        self.set(Exit::Fatal(reason.into()));
    }

    // The first exit wins; later ones are ignored.
    fn set(&self, exit: Exit) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }

    pub fn exit(&self) -> Option<Exit> {
        self.tx.borrow().clone()
    }

    /// Resolves once an exit has been recorded.
    pub async fn stopped(&self) -> Exit {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return Exit::Requested;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_exit_wins() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.exit().is_none());
        lifecycle.fatal("disk full");
        lifecycle.request();
        assert_eq!(lifecycle.exit(), Some(Exit::Fatal("disk full".into())));
        assert_eq!(lifecycle.stopped().await, Exit::Fatal("disk full".into()));
    }

    #[tokio::test]
    async fn stopped_wakes_waiters() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.request();
        let exit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("join");
        assert_eq!(exit, Exit::Requested);
    }
}
