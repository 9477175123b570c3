use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;

/// A transport handle created on first use, at most once.
///
/// Steady-state reads are a lock-free load. Callers racing on the first use
/// serialize on `init`, and the slot is checked again once the guard is held
/// so only the first of them creates the handle. The rest wait and observe
/// the same `Arc`.
pub struct LazyHandle<T> {
    handle: ArcSwapOption<T>,
    init: Mutex<()>,
}

impl<T> LazyHandle<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handle: ArcSwapOption::empty(),
            init: Mutex::new(()),
        }
    }

    /// Returns the handle if it has been created.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.handle.load_full()
    }

    /// Returns the handle, creating it with `init` if the slot is empty.
    ///
    /// A failed `init` leaves the slot empty so a later call can try again.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `init`.
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(handle) = self.handle.load_full() {
            return Ok(handle);
        }

        let _guard = self.init.lock().await;

        if let Some(handle) = self.handle.load_full() {
            return Ok(handle);
        }

        let handle = Arc::new(init().await?);
        self.handle.store(Some(handle.clone()));

        Ok(handle)
    }

    /// Empties the slot and returns what it held.
    ///
    /// Waits for an in-flight creation so a handle created concurrently with
    /// teardown is not leaked.
    pub async fn take(&self) -> Option<Arc<T>> {
        let _guard = self.init.lock().await;
        self.handle.swap(None)
    }
}

impl<T> Default for LazyHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for LazyHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyHandle")
            .field("initialized", &self.handle.load().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_once() {
        let lazy = Arc::new(LazyHandle::<usize>::new());
        let creations = Arc::new(AtomicUsize::new(0));

        let callers = (0..32).map(|_| {
            let lazy = lazy.clone();
            let creations = creations.clone();
            tokio::spawn(async move {
                lazy.get_or_try_init(|| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, ()>(creations.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap()
            })
        });

        let handles: Vec<Arc<usize>> = join_all(callers)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn test_failed_init_leaves_slot_empty() {
        let lazy = LazyHandle::<u8>::new();

        let failed = lazy.get_or_try_init(|| async { Err::<u8, _>("boom") }).await;
        assert_eq!(failed, Err("boom"));
        assert!(lazy.get().is_none());

        let created = lazy.get_or_try_init(|| async { Ok::<_, &str>(7) }).await.unwrap();
        assert_eq!(*created, 7);
    }

    #[tokio::test]
    async fn test_take_empties_slot() {
        let lazy = LazyHandle::<u8>::new();
        lazy.get_or_try_init(|| async { Ok::<_, ()>(1) }).await.unwrap();

        assert_eq!(lazy.take().await.as_deref(), Some(&1));
        assert!(lazy.get().is_none());
        assert!(lazy.take().await.is_none());
    }
}
