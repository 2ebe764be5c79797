use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;

/// Lock table keyed by name: at most one holder per key, unrelated keys
/// never contend beyond the brief table lookup.
///
/// Entries live only while some caller holds or waits on them.
#[derive(Debug, Default)]
pub struct NameLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let slot = self.slot(key);
        let out = {
            let _held = slot.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        self.release(key, slot);
        out
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = self.table();
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release(&self, key: &str, slot: Arc<Mutex<()>>) {
        let mut table = self.table();
        // Slots are only cloned under the table lock, so a count of two
        // (table + `slot`) means no one else holds or waits on it.
        if Arc::strong_count(&slot) == 2 {
            table.remove(key);
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

#[derive(Debug, Default)]
struct Claims {
    owners: HashMap<String, ThreadId>,
    /// The key each blocked thread is waiting for.
    waiting: HashMap<ThreadId, String>,
}

impl Claims {
    /// True if `owner` is `me`, or is blocked (transitively) on a key `me` owns.
    fn leads_back_to(&self, mut owner: ThreadId, me: ThreadId) -> bool {
        for _ in 0..=self.waiting.len() {
            if owner == me {
                return true;
            }
            let Some(next) = self
                .waiting
                .get(&owner)
                .and_then(|key| self.owners.get(key))
            else {
                return false;
            };
            owner = *next;
        }
        false
    }
}

/// Names currently being loaded, each owned by one thread.
///
/// Unlike [`NameLocks`], a claim that would wait on itself, directly or
/// through a chain of threads waiting on each other, is refused instead of
/// blocking.
#[derive(Debug, Default)]
pub struct InFlight {
    claims: Mutex<Claims>,
    released: Condvar,
}

pub enum Claim<'a> {
    Acquired(InFlightGuard<'a>),
    /// The name is already being loaded by this thread, or by a thread that
    /// is waiting on this one.
    Reentrant,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks while another thread owns `key`.
    pub fn claim(&self, key: &str) -> Claim<'_> {
        let me = std::thread::current().id();
        let mut claims = self.lock();
        while let Some(owner) = claims.owners.get(key).copied() {
            if claims.leads_back_to(owner, me) {
                claims.waiting.remove(&me);
                return Claim::Reentrant;
            }
            claims.waiting.insert(me, key.to_string());
            claims = self
                .released
                .wait(claims)
                .unwrap_or_else(|e| e.into_inner());
        }
        claims.waiting.remove(&me);
        claims.owners.insert(key.to_string(), me);
        Claim::Acquired(InFlightGuard {
            table: self,
            key: key.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn waiters(&self) -> usize {
        self.lock().waiting.len()
    }
}

pub struct InFlightGuard<'a> {
    table: &'a InFlight,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().owners.remove(&self.key);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_a_slot() {
        let locks = NameLocks::new();
        assert!(Arc::ptr_eq(&locks.slot("a"), &locks.slot("a")));
        assert!(!Arc::ptr_eq(&locks.slot("a"), &locks.slot("b")));
    }

    #[test]
    fn unrelated_keys_do_not_block() {
        let locks = NameLocks::new();
        let a = locks.slot("a");
        let _held = a.lock().unwrap();
        let b = locks.slot("b");
        assert!(b.try_lock().is_ok());
        let a2 = locks.slot("a");
        assert!(a2.try_lock().is_err());
    }

    #[test]
    fn idle_slots_are_dropped() {
        let locks = NameLocks::new();
        assert_eq!(locks.with_lock("a", || 7), 7);
        assert_eq!(locks.len(), 0);

        let held = locks.slot("b");
        locks.with_lock("b", || assert_eq!(locks.len(), 1));
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.with_lock("b", || ());
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn reclaiming_on_the_owning_thread_is_reentrant() {
        let inflight = InFlight::new();
        let first = inflight.claim("a");
        assert!(matches!(first, Claim::Acquired(_)));
        assert!(matches!(inflight.claim("a"), Claim::Reentrant));
        assert!(matches!(inflight.claim("b"), Claim::Acquired(_)));
        drop(first);
        assert!(matches!(inflight.claim("a"), Claim::Acquired(_)));
    }

    #[test]
    fn other_threads_wait_for_release() {
        let inflight = Arc::new(InFlight::new());
        let held = inflight.claim("a");
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let inflight = inflight.clone();
            std::thread::spawn(move || {
                let claim = inflight.claim("a");
                tx.send(matches!(claim, Claim::Acquired(_))).unwrap();
            })
        };
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(100))
            .is_err());
        drop(held);
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
        worker.join().unwrap();
    }

    #[test]
    fn crossed_claims_between_threads_do_not_deadlock() {
        let inflight = Arc::new(InFlight::new());
        let held_a = inflight.claim("a");
        let (claimed_b, ready) = std::sync::mpsc::channel();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let inflight = inflight.clone();
            std::thread::spawn(move || {
                let held_b = inflight.claim("b");
                claimed_b.send(()).unwrap();
                // Blocks until the main thread releases "a".
                let got_a = matches!(inflight.claim("a"), Claim::Acquired(_));
                drop(held_b);
                tx.send(got_a).unwrap();
            })
        };
        ready.recv().unwrap();
        while inflight.waiters() == 0 {
            std::thread::yield_now();
        }

        // "b" is owned by a thread waiting on our "a": waiting would deadlock.
        assert!(matches!(inflight.claim("b"), Claim::Reentrant));
        assert_eq!(inflight.waiters(), 1);

        drop(held_a);
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
        worker.join().unwrap();
        assert!(matches!(inflight.claim("b"), Claim::Acquired(_)));
    }
}
