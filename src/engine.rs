//! The single writer that owns the cache map.
//!
//! Every read and mutation travels through one bounded queue and is applied by
//! one task, in arrival order. Connection handlers never touch the map.

use crate::expire::ExpiryScheduler;
use crate::persistence::journal::JournalRecord;
use crate::protocol::{Method, Request, Response};
use crate::store::CacheMap;
use crate::store::entry::CacheEntry;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the engine's request queue.
pub const ENGINE_QUEUE_DEPTH: usize = 1024;

/// Where the engine writes the reply for a client request.
pub type ReplySender = mpsc::UnboundedSender<Response>;

/// A unit of work for the engine.
#[derive(Debug)]
pub enum Envelope {
    /// Came off a connection and expects exactly one reply.
    Client(ClientRequest),
    /// Generated inside the server; nobody is waiting for a reply.
    Internal(InternalRequest),
}

#[derive(Debug)]
pub struct ClientRequest {
    pub conn: ReplySender,
    pub req: Request,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalRequest {
    /// A timer fired. Only removes the key if it still holds `generation`.
    Expire { key: String, generation: u64 },
}

#[derive(Debug, thiserror::Error)]
#[error("cache engine has shut down")]
pub struct EngineClosed;

/// Cloneable sending side of the engine queue.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Envelope>,
}

impl EngineHandle {
    /// Queue a client request. Waits while the queue is full.
    pub async fn submit(&self, conn: ReplySender, req: Request) -> Result<(), EngineClosed> {
        self.tx
            .send(Envelope::Client(ClientRequest { conn, req }))
            .await
            .map_err(|_| EngineClosed)
    }
}

#[derive(Debug)]
pub struct Engine {
    store: CacheMap,
    scheduler: ExpiryScheduler,
    rx: mpsc::Receiver<Envelope>,
}

impl Engine {
    pub fn new() -> (Engine, EngineHandle) {
        let (tx, rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
        let engine = Engine {
            store: CacheMap::new(),
            scheduler: ExpiryScheduler::new(tx.clone()),
            rx,
        };
        (engine, EngineHandle { tx })
    }

    pub fn store(&self) -> &CacheMap {
        &self.store
    }

    /// Start processing the queue on its own task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => self.apply(envelope),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Engine stopped with {} keys", self.store.len());
    }

    pub fn apply(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Client(ClientRequest { conn, req }) => {
                let response = self.execute(&req);
                // The connection may have closed while the request was queued.
                let _ = conn.send(response);
            }
            Envelope::Internal(InternalRequest::Expire { key, generation }) => {
                if self.store.remove_generation(&key, generation) {
                    debug!("Expired key {key:?}");
                }
            }
        }
    }

    fn execute(&mut self, req: &Request) -> Response {
        match req.method {
            Method::Get => match self.store.get(&req.key) {
                Some(entry) => Response::Value(entry.value.clone()),
                None => Response::NotFound,
            },
            Method::Set if req.expire_secs < 0 => {
                // Expired on arrival: drops whatever the key held, timer included.
                self.store.remove(&req.key);
                Response::Ok
            }
            Method::Set => {
                let expire = if req.expire_secs > 0 {
                    Some(Duration::from_secs(req.expire_secs as u64))
                } else {
                    None
                };
                self.install(req.key.clone(), req.value.clone(), expire);
                Response::Ok
            }
            Method::Delete => {
                if self.store.remove(&req.key) {
                    Response::Ok
                } else {
                    Response::NotFound
                }
            }
        }
    }

    /// Cancel the old timer, then install the value and arm a fresh timer.
    fn install(&mut self, key: String, value: String, expire: Option<Duration>) {
        self.store.cancel_timer(&key);
        let generation = self.store.next_generation();
        let entry = match expire {
            Some(after) => {
                let timer = self.scheduler.arm(key.clone(), generation, after);
                CacheEntry::with_timer(value, generation, timer)
            }
            None => CacheEntry::new(value, generation),
        };
        self.store.insert(key, entry);
    }

    /// Re-apply one journal record at startup. `now` is in nanoseconds since
    /// the UNIX epoch.
    pub fn restore(&mut self, record: &JournalRecord, now: i64) {
        match record.method {
            Method::Delete => {
                self.store.remove(&record.key);
            }
            Method::Set if record.expire == 0 => {
                self.install(record.key.clone(), record.value.clone(), None);
            }
            Method::Set if record.expire > now => {
                let remaining = Duration::from_nanos((record.expire - now) as u64);
                self.install(record.key.clone(), record.value.clone(), Some(remaining));
            }
            Method::Set => {
                // Already past its deadline: the set happened and has since expired.
                // Any earlier value was overwritten by it before that, so it goes too.
                self.store.remove(&record.key);
            }
            Method::Get => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn call(handle: &EngineHandle, req: Request) -> Response {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.submit(tx, req).await.unwrap();
        rx.recv().await.unwrap()
    }

    fn apply_client(engine: &mut Engine, req: Request) -> Response {
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.apply(Envelope::Client(ClientRequest { conn: tx, req }));
        rx.try_recv().unwrap()
    }

    fn record(method: Method, key: &str, value: &str, expire: i64) -> JournalRecord {
        JournalRecord {
            method,
            key: key.to_string(),
            value: value.to_string(),
            expire,
        }
    }

    #[tokio::test]
    async fn test_missing_key_reports_not_found() {
        let (mut engine, _handle) = Engine::new();
        assert_eq!(apply_client(&mut engine, Request::get("k")), Response::NotFound);
        assert_eq!(apply_client(&mut engine, Request::delete("k")), Response::NotFound);
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (mut engine, _handle) = Engine::new();
        assert_eq!(apply_client(&mut engine, Request::set("k", "v", 0)), Response::Ok);
        assert_eq!(
            apply_client(&mut engine, Request::get("k")),
            Response::Value("v".into())
        );
        assert_eq!(apply_client(&mut engine, Request::delete("k")), Response::Ok);
        assert_eq!(apply_client(&mut engine, Request::get("k")), Response::NotFound);
    }

    #[tokio::test]
    async fn test_stale_expire_ignored_after_overwrite() {
        let (mut engine, _handle) = Engine::new();
        apply_client(&mut engine, Request::set("k", "v1", 60));
        let stale = engine.store().get("k").unwrap().generation;

        apply_client(&mut engine, Request::set("k", "v2", 0));
        engine.apply(Envelope::Internal(InternalRequest::Expire {
            key: "k".into(),
            generation: stale,
        }));

        assert_eq!(
            apply_client(&mut engine, Request::get("k")),
            Response::Value("v2".into())
        );
        assert_eq!(engine.store().expires_count(), 0);
    }

    #[tokio::test]
    async fn test_negative_expire_expires_immediately() {
        let (mut engine, _handle) = Engine::new();
        assert_eq!(apply_client(&mut engine, Request::set("k", "v", -1)), Response::Ok);
        assert_eq!(apply_client(&mut engine, Request::get("k")), Response::NotFound);

        apply_client(&mut engine, Request::set("k", "old", 60));
        assert_eq!(apply_client(&mut engine, Request::set("k", "new", -1)), Response::Ok);
        assert_eq!(apply_client(&mut engine, Request::get("k")), Response::NotFound);
        assert_eq!(engine.store().expires_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_removes_key() {
        let (engine, handle) = Engine::new();
        let shutdown = CancellationToken::new();
        let task = engine.spawn(shutdown.clone());

        assert_eq!(call(&handle, Request::set("k", "v", 1)).await, Response::Ok);
        assert_eq!(call(&handle, Request::get("k")).await, Response::Value("v".into()));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(call(&handle, Request::get("k")).await, Response::NotFound);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_expiry() {
        let (engine, handle) = Engine::new();
        let shutdown = CancellationToken::new();
        engine.spawn(shutdown.clone());

        call(&handle, Request::set("k", "v1", 1)).await;
        call(&handle, Request::set("k", "v2", 0)).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(call(&handle, Request::get("k")).await, Response::Value("v2".into()));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_restore_policy() {
        let (mut engine, _handle) = Engine::new();
        let now = 1_000_000_000_000;

        engine.restore(&record(Method::Set, "plain", "a", 0), now);
        engine.restore(&record(Method::Set, "past", "b", now - 1), now);
        engine.restore(&record(Method::Set, "future", "c", now + 60_000_000_000), now);
        engine.restore(&record(Method::Set, "gone", "d", 0), now);
        engine.restore(&record(Method::Delete, "gone", "", 0), now);

        assert_eq!(engine.store().get("plain").unwrap().value, "a");
        assert!(!engine.store().contains("past"));
        assert!(engine.store().get("future").unwrap().has_timer());
        assert!(!engine.store().contains("gone"));
    }

    #[tokio::test]
    async fn test_restore_expired_set_shadows_older_value() {
        let (mut engine, _handle) = Engine::new();
        let now = 1_000_000_000_000;

        engine.restore(&record(Method::Set, "k", "old", 0), now);
        engine.restore(&record(Method::Set, "k", "new", now - 5), now);

        assert!(!engine.store().contains("k"));
    }
}
