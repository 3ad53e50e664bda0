use std::path::PathBuf;

use tokio::sync::mpsc;

/// Signals from a storage change notifier (filesystem watcher or similar).
///
/// Delivery is best effort: signals may be dropped or duplicated, which is
/// why the coordinator also runs a fallback timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierSignal {
    /// Paths that changed.
    Change(Vec<PathBuf>),
    /// The notifier hit an error. Logged; the pipeline keeps running.
    Error(String),
}

pub type NotifierSender = mpsc::Sender<NotifierSignal>;
pub type NotifierReceiver = mpsc::Receiver<NotifierSignal>;

/// Create the channel a notifier publishes on and the coordinator reads.
pub fn channel(capacity: usize) -> (NotifierSender, NotifierReceiver) {
    mpsc::channel(capacity.max(1))
}
