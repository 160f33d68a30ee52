use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// Whether the watched node exists, as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistenceState {
    /// Never synced
    #[default]
    Unknown,
    Exists,
    NotExists,
}

impl ExistenceState {
    fn as_u8(self) -> u8 {
        match self {
            ExistenceState::Unknown => 0,
            ExistenceState::Exists => 1,
            ExistenceState::NotExists => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ExistenceState::Exists,
            2 => ExistenceState::NotExists,
            _ => ExistenceState::Unknown,
        }
    }
}

/// Lock-free cell read by the fast path of `get()`.
///
/// Only written while the owning resource's lock is held.
#[derive(Debug, Default)]
pub(crate) struct AtomicExistence(AtomicU8);

impl AtomicExistence {
    pub(crate) fn load(&self) -> ExistenceState {
        ExistenceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(
        &self,
        state: ExistenceState,
    ) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}
