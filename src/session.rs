use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU16, Ordering},
    },
};

use n0_error::{e, stack_error};
use tokio::sync::mpsc;

use crate::wire::IcmpEcho;

/// Fragments buffered per in-flight session before the dispatcher starts
/// dropping. A full inbox means the waiter is hopelessly behind; dropping a
/// data fragment lets the session fail by timeout instead of blocking the
/// dispatcher.
pub(crate) const INBOX_CAPACITY: usize = 128;

/// Registry of in-flight sessions, keyed by the 16-bit ICMP identifier.
///
/// The table holds the sending half of each session inbox; the waiting task
/// owns the receiving half inside a [`Session`] guard. Dropping the guard
/// removes the entry, so an id can never outlive its waiter.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: RwLock<HashMap<u16, mpsc::Sender<IcmpEcho>>>,
    next_id: AtomicU16,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Allocates a free identifier and registers a fresh inbox for it.
    ///
    /// Allocation probes forward from a monotonic cursor and inserts under a
    /// single write-lock acquisition, so concurrent callers always receive
    /// distinct ids.
    pub fn open(self: &Arc<Self>) -> Result<Session, SessionError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut inner = self.inner.write().expect("session table poisoned");
        if inner.len() > u16::MAX as usize {
            return Err(e!(SessionError::Exhausted));
        }
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !inner.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.insert(id, tx);
        Ok(Session {
            id,
            inbox: rx,
            table: self.clone(),
        })
    }

    /// Registers an inbox under a caller-chosen identifier.
    pub fn open_at(self: &Arc<Self>, id: u16) -> Result<Session, SessionError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut inner = self.inner.write().expect("session table poisoned");
        if inner.contains_key(&id) {
            return Err(e!(SessionError::DuplicateId { id }));
        }
        inner.insert(id, tx);
        Ok(Session {
            id,
            inbox: rx,
            table: self.clone(),
        })
    }

    /// Returns the inbox sender for an id, if a session is waiting on it.
    pub fn lookup(&self, id: u16) -> Option<mpsc::Sender<IcmpEcho>> {
        self.inner
            .read()
            .expect("session table poisoned")
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("session table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent removal.
    fn unregister(&self, id: u16) {
        self.inner.write().expect("session table poisoned").remove(&id);
    }
}

/// Errors registering a session.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum SessionError {
    /// The identifier is already bound to a live session.
    #[error("session id {id} is already in flight")]
    DuplicateId { id: u16 },
    /// Every 16-bit identifier is in flight.
    #[error("session identifier space exhausted")]
    Exhausted,
}

/// A live session registration.
///
/// Owns the receiving half of the inbox; unregisters the id on drop, which
/// covers the success, timeout, and cancellation exits alike.
#[derive(Debug)]
pub struct Session {
    id: u16,
    inbox: mpsc::Receiver<IcmpEcho>,
    table: Arc<SessionTable>,
}

impl Session {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Awaits the next fragment routed to this session.
    pub async fn recv(&mut self) -> Option<IcmpEcho> {
        self.inbox.recv().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.table.unregister(self.id);
    }
}
