use parking_lot::{lock_api::RawMutex, RawMutex as Lock};

/// Serializes every externally callable heap entry point. The mutex is raw
/// so a collection can take it in `collect_start` and release it in
/// `collect_end`; the semantic re-entrancy counter (`lock_depth`) lives on
/// the heap itself and is a separate mechanism.
pub struct LockGate {
    mutex: Lock,
}

impl LockGate {
    pub const fn new() -> Self {
        Self { mutex: Lock::INIT }
    }

    #[inline]
    pub fn enter(&self) {
        self.mutex.lock();
    }

    #[inline]
    pub fn exit(&self) {
        debug_assert!(self.mutex.is_locked());
        unsafe { self.mutex.unlock() };
    }
}

impl Default for LockGate {
    fn default() -> Self {
        Self::new()
    }
}
