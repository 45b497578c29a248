// Session registry: `SessionId` → relay handle.
//
// One `parking_lot::Mutex` guards both the id counter and the map, so
// assigning an id and inserting its entry happen as one step with respect to
// concurrent `start`/`join` requests. The `start` closure passed to
// `create_session` runs under that lock; for relays it only spawns the relay
// thread (binding happens on that thread), so the lock is never held across a
// bind or an accept loop.
//
// Ids start at 1, increase strictly, and are never reused: a failed `start`
// or a later removal still consumes the id.
//
// The registry is generic over the handle type so its bookkeeping can be
// exercised without sockets; the coordinator uses `SessionRegistry<RelayHandle>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use huddle_protocol::SessionId;
use parking_lot::Mutex;

use crate::relay::RelayHandle;

pub struct SessionRegistry<H = RelayHandle> {
    inner: Mutex<RegistryInner<H>>,
}

struct RegistryInner<H> {
    sessions: BTreeMap<SessionId, Arc<H>>,
    next_id: u64,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionRegistry<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Assign the next id, build its handle with `start`, and store it.
    /// If `start` fails the id is consumed and nothing is stored.
    pub fn create_session<E>(
        &self,
        start: impl FnOnce(SessionId) -> Result<H, E>,
    ) -> Result<(SessionId, Arc<H>), E> {
        let mut inner = self.inner.lock();
        let id = SessionId(inner.next_id);
        inner.next_id += 1;

        let handle = Arc::new(start(id)?);
        inner.sessions.insert(id, Arc::clone(&handle));
        Ok((id, handle))
    }

    pub fn lookup_session(&self, id: SessionId) -> Option<Arc<H>> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    pub fn remove_session(&self, id: SessionId) -> Option<Arc<H>> {
        self.inner.lock().sessions.remove(&id)
    }

    /// Remove `id` only if `predicate` holds for its handle, checked under the
    /// registry lock.
    pub fn remove_session_if(
        &self,
        id: SessionId,
        predicate: impl FnOnce(&H) -> bool,
    ) -> Option<Arc<H>> {
        let mut inner = self.inner.lock();
        if predicate(inner.sessions.get(&id)?) {
            inner.sessions.remove(&id)
        } else {
            None
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.lock().sessions.keys().copied().collect()
    }

    /// Remove and return every entry, in id order.
    pub fn drain(&self) -> Vec<(SessionId, Arc<H>)> {
        std::mem::take(&mut self.inner.lock().sessions)
            .into_iter()
            .collect()
    }
}
