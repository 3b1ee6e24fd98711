use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the change channel; slow subscribers see `Lagged` and should relist.
const CHANNEL_CAPACITY: usize = 64;

/// A modification of the shared folder made through the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FolderChange {
    Created { name: String },
    Deleted { name: String },
}

impl FolderChange {
    pub fn name(&self) -> &str {
        match self {
            Self::Created { name } | Self::Deleted { name } => name,
        }
    }
}

/// Fan-out of folder changes to whoever is watching (console, tests).
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<FolderChange>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FolderChange> {
        self.tx.subscribe()
    }

    /// Never blocks; having no subscribers is fine.
    pub fn notify(&self, change: FolderChange) {
        let _ = self.tx.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_changes_in_order() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.notify(FolderChange::Created { name: "a".into() });
        notifier.notify(FolderChange::Deleted { name: "a".into() });

        assert_eq!(
            rx.recv().await.unwrap(),
            FolderChange::Created { name: "a".into() }
        );
        assert_eq!(rx.recv().await.unwrap().name(), "a");
    }

    #[test]
    fn notify_without_subscribers_is_silent() {
        ChangeNotifier::new().notify(FolderChange::Created { name: "x".into() });
    }
}
