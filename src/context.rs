use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Cancellation signal shared between the agent main thread and the workers it
/// spawns. Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Context<T>(Arc<(Mutex<T>, Condvar)>);

impl<T> Context<T>
where
    T: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation value and wakes every thread blocked on this context.
    pub fn cancel_all(&self, val: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        let (lck, cvar) = &*self.0;
        let mut lck = lck.lock()?;
        *lck = val;
        cvar.notify_all();
        Ok(())
    }
}

impl Context<bool> {
    pub fn is_cancelled(&self) -> bool {
        let (lck, _) = &*self.0;
        lck.lock().map(|v| *v).unwrap_or(true)
    }

    /// Blocks the calling thread until the context is cancelled.
    pub fn wait(&self) {
        let (lck, cvar) = &*self.0;
        let Ok(guard) = lck.lock() else { return };
        drop(cvar.wait_while(guard, |cancelled| !*cancelled));
    }
}
