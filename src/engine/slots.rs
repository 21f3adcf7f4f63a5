use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Non-blocking exclusion between compiles and frames.
///
/// Clones share the same flag, so a host can hold the lock from elsewhere.
#[derive(Clone, Default, Debug)]
pub struct CompileLock {
    held: Arc<AtomicBool>,
}

impl CompileLock {
    pub fn try_acquire(&self) -> Option<CompileGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CompileGuard {
                held: self.held.clone(),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the lock on drop, including on early returns.
#[derive(Debug)]
pub struct CompileGuard {
    held: Arc<AtomicBool>,
}

impl Drop for CompileGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// The active program and the last one known to work.
#[derive(Debug)]
pub struct PipelineSlots<T> {
    current: Option<T>,
    current_valid: bool,
    last_good: Option<T>,
}

impl<T> Default for PipelineSlots<T> {
    fn default() -> Self {
        Self {
            current: None,
            current_valid: false,
            last_good: None,
        }
    }
}

impl<T> PipelineSlots<T> {
    /// Makes `program` current.
    ///
    /// The outgoing program becomes the rollback target only if it was valid;
    /// a failed program never displaces a working one.
    pub fn install(&mut self, program: T, valid: bool) {
        let previous = self.current.replace(program);
        if self.current_valid {
            self.last_good = previous;
        }
        self.current_valid = valid;
    }

    /// Marks the current program as failed at run time.
    pub fn invalidate(&mut self) {
        self.current_valid = false;
    }

    /// Reverts to the last working program. Returns false when there was none,
    /// in which case nothing runs until the next install.
    pub fn rollback(&mut self) -> bool {
        self.current = self.last_good.take();
        self.current_valid = self.current.is_some();
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.current.as_mut()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.current_valid = false;
        self.last_good = None;
    }
}
