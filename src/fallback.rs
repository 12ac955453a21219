use std::sync::atomic::{AtomicBool, Ordering};

static FORCE_FALLBACK: AtomicBool = AtomicBool::new(false);

/// Force every operation through the host-code tier, process-wide.
pub fn set_force_fallback(on: bool) {
    FORCE_FALLBACK.store(on, Ordering::SeqCst);
}

pub fn force_fallback() -> bool {
    FORCE_FALLBACK.load(Ordering::SeqCst)
}

/// Fallback configuration threaded through processor constructors.
///
/// The process-wide flag and the per-processor flag are independent so a
/// test can isolate one processor without touching global state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackConfig {
    pub force_fallback: bool,
}

impl FallbackConfig {
    pub fn effective(&self) -> bool {
        self.force_fallback || force_fallback()
    }
}
