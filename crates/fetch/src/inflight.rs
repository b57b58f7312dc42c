//! Registry of in-flight GET requests, keyed by request fingerprint.
//!
//! The first caller spawns the underlying work and registers a shared handle;
//! later callers with the same key await that handle instead of issuing a new
//! call. The spawned task removes its own entry once it settles, so the entry
//! disappears whether the call succeeded or failed and regardless of how many
//! waiters are still listening.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    futures::future::{BoxFuture, FutureExt, Shared},
    tracing::trace,
};

use crate::{error::FetchError, options::FetchResponse};

pub(crate) type FetchResult = Result<FetchResponse, FetchError>;
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
}

#[derive(Default)]
pub(crate) struct InFlightRegistry {
    entries: DashMap<String, InFlight>,
    next_id: AtomicU64,
}

impl InFlightRegistry {
    /// Attach to the call registered under `key`, or start one with `start`.
    ///
    /// Returns the shared handle and whether an existing call was joined.
    pub(crate) fn join_or_start<F>(self: &Arc<Self>, key: String, start: F) -> (SharedFetch, bool)
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => (occupied.get().future.clone(), true),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let key = vacant.key().clone();
                let registry = Arc::clone(self);
                let work = start();

                let handle = tokio::spawn(async move {
                    let result = work.await;
                    // A newer call may have replaced ours after a clear.
                    registry.entries.remove_if(&key, |_, entry| entry.id == id);
                    trace!(key = %key, "in-flight request settled");
                    result
                });

                let future = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(FetchError::Aborted),
                        Err(e) => Err(FetchError::Request(format!("fetch task failed: {e}"))),
                    }
                }
                .boxed()
                .shared();

                vacant.insert(InFlight {
                    id,
                    future: future.clone(),
                });
                (future, false)
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Forget entries whose key contains `filter`, or all of them. Calls
    /// already running are not cancelled; current waiters still get their
    /// result, but new callers start fresh.
    pub(crate) fn clear(&self, filter: Option<&str>) {
        match filter {
            Some(needle) => self.entries.retain(|key, _| !key.contains(needle)),
            None => self.entries.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        bytes::Bytes,
        reqwest::{StatusCode, header::HeaderMap},
        std::sync::atomic::AtomicUsize,
        tokio::sync::oneshot,
    };

    fn response(body: &'static str) -> FetchResponse {
        FetchResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn second_caller_joins_first() {
        let registry = Arc::new(InFlightRegistry::default());
        let starts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<FetchResult>();

        let counter = Arc::clone(&starts);
        let (first, joined_first) = registry.join_or_start("GET:/a:".into(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { rx.await.unwrap_or(Err(FetchError::Aborted)) }.boxed()
        });
        let counter = Arc::clone(&starts);
        let (second, joined_second) = registry.join_or_start("GET:/a:".into(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(response("other")) }.boxed()
        });

        assert!(!joined_first);
        assert!(joined_second);
        assert_eq!(registry.len(), 1);

        tx.send(Ok(response("shared"))).unwrap();
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap().body, Bytes::from_static(b"shared"));
        assert_eq!(b.unwrap().body, Bytes::from_static(b"shared"));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn failure_is_shared_and_entry_removed() {
        let registry = Arc::new(InFlightRegistry::default());
        let (tx, rx) = oneshot::channel::<FetchResult>();
        let (first, _) = registry.join_or_start("k".into(), move || {
            async move { rx.await.unwrap_or(Err(FetchError::Aborted)) }.boxed()
        });
        let (second, _) = registry.join_or_start("k".into(), || async { Ok(response("x")) }.boxed());

        tx.send(Err(FetchError::Network("reset".into()))).unwrap();
        let (a, b) = tokio::join!(first, second);
        assert!(matches!(a, Err(FetchError::Network(ref m)) if m == "reset"));
        assert!(matches!(b, Err(FetchError::Network(ref m)) if m == "reset"));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn waiters_dropping_does_not_cancel_work() {
        let registry = Arc::new(InFlightRegistry::default());
        let (tx, rx) = oneshot::channel::<FetchResult>();
        let (first, _) = registry.join_or_start("k".into(), move || {
            async move { rx.await.unwrap_or(Err(FetchError::Aborted)) }.boxed()
        });
        drop(first);

        let (late, joined) = registry.join_or_start("k".into(), || async { Ok(response("new")) }.boxed());
        assert!(joined);
        tx.send(Ok(response("original"))).unwrap();
        assert_eq!(late.await.unwrap().body, Bytes::from_static(b"original"));
    }

    #[tokio::test]
    async fn stale_task_does_not_remove_replacement() {
        let registry = Arc::new(InFlightRegistry::default());
        let (tx_old, rx_old) = oneshot::channel::<FetchResult>();
        let (old, _) = registry.join_or_start("k".into(), move || {
            async move { rx_old.await.unwrap_or(Err(FetchError::Aborted)) }.boxed()
        });

        registry.clear(Some("k"));
        assert_eq!(registry.len(), 0);

        let (tx_new, rx_new) = oneshot::channel::<FetchResult>();
        let (new, joined) = registry.join_or_start("k".into(), move || {
            async move { rx_new.await.unwrap_or(Err(FetchError::Aborted)) }.boxed()
        });
        assert!(!joined);

        tx_old.send(Ok(response("old"))).unwrap();
        old.await.unwrap();
        assert_eq!(registry.len(), 1);

        tx_new.send(Ok(response("new"))).unwrap();
        new.await.unwrap();
        assert_eq!(registry.len(), 0);
    }
}
