//! Session generations for stale-result detection.
//!
//! Every connect starts a new generation. Work started under an older
//! generation keeps running but must check its token before applying results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct SessionCounter {
    current: Arc<AtomicU64>,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation, invalidating every earlier token.
    pub fn begin(&self) -> SessionToken {
        let generation = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        SessionToken {
            generation,
            current: Arc::clone(&self.current),
        }
    }

    /// Invalidates outstanding tokens without handing out a new one.
    pub fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl SessionToken {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_invalidates_old() {
        let sessions = SessionCounter::new();
        let first = sessions.begin();
        assert!(first.is_current());

        let second = sessions.begin();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert_eq!(second.generation(), first.generation() + 1);

        sessions.invalidate();
        assert!(!second.is_current());
    }
}
