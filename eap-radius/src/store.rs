//! Correlator-keyed storage of suspended sessions.
//!
//! Between rounds a session is detached from its request (frozen) and stored
//! under its correlator, the value of the RADIUS `State` attribute. The
//! store hands each session out under exclusive ownership: a thaw removes
//! the session and leaves a busy marker behind, so a retransmission that
//! arrives while the previous round is still being processed is refused
//! rather than run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::session::EapSession;

/// The opaque token tying a round to its session; equal to the value of the
/// RADIUS `State` attribute.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Correlator(Vec<u8>);

impl Correlator {
    /// Octets of a generated correlator.
    const GENERATED_LEN: usize = 16;

    /// Wraps the octets of a `State` attribute.
    pub fn from_octets(octets: impl Into<Vec<u8>>) -> Self {
        Self(octets.into())
    }

    /// Draws a fresh correlator from the instance RNG.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let mut octets = vec![0; Self::GENERATED_LEN];
        rng.fill(octets.as_mut_slice());
        Self(octets)
    }

    /// The raw octets, as written into the `State` attribute.
    pub fn octets(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Correlator(")?;
        for octet in &self.0 {
            write!(f, "{octet:02x}")?;
        }
        write!(f, ")")
    }
}

/// An error thawing a session.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThawError {
    /// No session is stored under the correlator.
    #[error("no session found for correlator")]
    NotFound,

    /// The session is checked out by another worker, i.e. the peer
    /// retransmitted before the previous round completed.
    #[error("session is active on another worker")]
    Busy,
}

enum Entry {
    Idle {
        session: Box<EapSession>,
        frozen_at: Instant,
    },
    Busy {
        since: Instant,
    },
}

impl Entry {
    fn age(&self, now: Instant) -> Duration {
        let then = match self {
            Self::Idle { frozen_at, .. } => *frozen_at,
            Self::Busy { since } => *since,
        };
        now.duration_since(then)
    }
}

/// The session store.
pub struct SessionStore {
    inner: Mutex<HashMap<Correlator, Entry>>,
    lifetime: Duration,
}

impl SessionStore {
    /// A store whose sessions outlive their last round by `lifetime` (the
    /// `State` attribute lifetime).
    pub fn new(lifetime: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    /// Checks the session stored under `correlator` out to the caller.
    ///
    /// The caller owns the session exclusively until it is frozen, parked,
    /// or discarded.
    pub fn thaw(&self, correlator: &[u8]) -> Result<Box<EapSession>, ThawError> {
        let key = Correlator::from_octets(correlator);
        let mut inner = self.inner.lock().expect("session store poisoned");
        let now = Instant::now();
        Self::sweep(&mut inner, self.lifetime, now);

        match inner.get(&key) {
            None => Err(ThawError::NotFound),
            Some(Entry::Busy { .. }) => Err(ThawError::Busy),
            Some(Entry::Idle { .. }) => {
                let Some(Entry::Idle { mut session, .. }) =
                    inner.insert(key.clone(), Entry::Busy { since: now })
                else {
                    unreachable!("entry kind checked above");
                };

                session.claim = Some(key);
                Ok(session)
            }
        }
    }

    /// Stores the session under its current correlator for the next round.
    ///
    /// A session in a terminal state is dropped instead of stored, running
    /// its opaque state's destructor; later thaws see `NotFound`.
    pub fn freeze(&self, session: Box<EapSession>) {
        let mut inner = self.inner.lock().expect("session store poisoned");
        let now = Instant::now();
        Self::sweep(&mut inner, self.lifetime, now);

        let mut session = session;
        if let Some(claim) = session.claim.take() {
            inner.remove(&claim);
        }

        if session.is_terminal() {
            return;
        }

        inner.insert(
            session.correlator().clone(),
            Entry::Idle {
                session,
                frozen_at: now,
            },
        );
    }

    /// Drops a checked-out session without storing it.
    pub fn discard(&self, mut session: Box<EapSession>) {
        if let Some(claim) = session.claim.take() {
            let mut inner = self.inner.lock().expect("session store poisoned");
            inner.remove(&claim);
        }
    }

    /// Clears a checked-out session's busy marker without storing it, for
    /// sessions that are about to be parked on a request instead.
    pub fn release(&self, session: &mut EapSession) {
        if let Some(claim) = session.claim.take() {
            let mut inner = self.inner.lock().expect("session store poisoned");
            inner.remove(&claim);
        }
    }

    /// Number of entries currently stored (idle or busy).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store poisoned").len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(inner: &mut HashMap<Correlator, Entry>, lifetime: Duration, now: Instant) {
        inner.retain(|_, entry| entry.age(now) < lifetime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radius::InstanceId;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(60))
    }

    fn session_under(correlator: [u8; 16]) -> Box<EapSession> {
        Box::new(EapSession::new(
            InstanceId::next(),
            Correlator::from_octets(correlator),
        ))
    }

    #[test]
    fn freeze_then_thaw_returns_the_session() {
        let store = store();
        let session = session_under([7; 16]);
        let id = session.id();

        store.freeze(session);
        let thawed = store.thaw(&[7; 16]).expect("session should be stored");

        assert_eq!(thawed.id(), id);
    }

    #[test]
    fn thawed_session_leaves_a_busy_marker() {
        let store = store();
        store.freeze(session_under([7; 16]));

        let _checked_out = store.thaw(&[7; 16]).expect("first thaw should succeed");

        assert_eq!(store.thaw(&[7; 16]), Err(ThawError::Busy));
    }

    #[test]
    fn freeze_clears_the_busy_marker() {
        let store = store();
        store.freeze(session_under([7; 16]));

        let mut session = store.thaw(&[7; 16]).expect("session should be stored");
        session.set_correlator(Correlator::from_octets([8; 16]));
        store.freeze(session);

        assert_eq!(store.thaw(&[7; 16]), Err(ThawError::NotFound));
        assert!(store.thaw(&[8; 16]).is_ok());
    }

    #[test]
    fn terminal_sessions_are_dropped_on_freeze() {
        let store = store();
        let mut session = session_under([7; 16]);
        session.mark_terminal(crate::session::Terminal::Failure);

        store.freeze(session);

        assert_eq!(store.thaw(&[7; 16]), Err(ThawError::NotFound));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_sessions_are_evicted() {
        let store = SessionStore::new(Duration::ZERO);
        store.freeze(session_under([7; 16]));

        assert_eq!(store.thaw(&[7; 16]), Err(ThawError::NotFound));
    }

    #[test]
    fn unknown_correlator_is_not_found() {
        assert_eq!(store().thaw(&[1, 2, 3]), Err(ThawError::NotFound));
    }
}
