use std::sync::{Arc, Mutex, PoisonError};

use crate::tree::FileSystemTree;

/// Receives the tree snapshot after each mutation.
pub type ChangeObserver = Box<dyn Fn(&FileSystemTree) + Send + Sync>;

/// Receives raw process output, unmodified, in arrival order.
pub type OutputSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Sink that discards everything.
pub fn discard() -> OutputSink {
    Arc::new(|_| {})
}

/// Single-subscriber change notification. Setting a new observer replaces the
/// previous one.
#[derive(Default)]
pub struct ChangeNotifier {
    observer: Mutex<Option<ChangeObserver>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: ChangeObserver) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn unsubscribe(&self) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver a snapshot, synchronously. `snapshot` only runs when someone
    /// is listening. The observer must not call back into `subscribe`.
    pub fn notify(&self, snapshot: impl FnOnce() -> FileSystemTree) {
        let observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(observer) = observer.as_ref() {
            observer(&snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::tree::FileTree;

    #[test]
    fn latest_subscriber_wins() {
        let notifier = ChangeNotifier::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut tree = FileTree::new();
        tree.write("a.txt", "x".into()).unwrap();

        let counter = Arc::clone(&first);
        notifier.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        notifier.notify(|| tree.enumerate());

        let counter = Arc::clone(&second);
        notifier.subscribe(Box::new(move |snapshot| {
            assert!(snapshot.contains_key("a.txt"));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        notifier.notify(|| tree.enumerate());

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        notifier.unsubscribe();
        assert!(!notifier.is_subscribed());
        notifier.notify(|| panic!("no subscriber"));
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
