use std::sync::Arc;

use tokio::sync::watch;

/// Owned, shareable list snapshot with change notification.
///
/// Readers get a cheap `Arc` of the current list; writers replace it wholesale.
/// Subscribers are only woken when the contents actually changed.
pub struct SnapshotStore<T> {
    sender: watch::Sender<Arc<Vec<T>>>,
}

impl<T> SnapshotStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(Arc::new(Vec::new()));
        Self { sender }
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.sender.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<T>>> {
        self.sender.subscribe()
    }

    /// Replaces the list unless it is equal to the current one.
    pub fn publish_if_changed(&self, items: Vec<T>) -> bool {
        self.sender.send_if_modified(|current| {
            if current.as_slice() == items.as_slice() {
                return false;
            }
            *current = Arc::new(items);
            true
        })
    }

    /// Lets `decide` compare against the current list and return the replacement, if any.
    pub fn publish_with(&self, decide: impl FnOnce(&[T]) -> Option<Vec<T>>) -> bool {
        self.sender.send_if_modified(|current| match decide(current.as_slice()) {
            Some(next) => {
                *current = Arc::new(next);
                true
            }
            None => false,
        })
    }

    /// In-place edit of the current list; `edit` reports whether it changed anything.
    pub fn update(&self, edit: impl FnOnce(&mut Vec<T>) -> bool) -> bool {
        self.sender.send_if_modified(|current| {
            let mut next = current.as_ref().clone();
            if !edit(&mut next) {
                return false;
            }
            *current = Arc::new(next);
            true
        })
    }
}

impl<T> Default for SnapshotStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
