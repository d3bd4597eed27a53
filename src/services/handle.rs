use std::sync::Mutex;

type StopFn = Box<dyn FnOnce() + Send>;

/// Detaches a listener or watcher. Stopping more than once is a no-op, and
/// dropping the handle stops it.
pub struct StopHandle {
    stop: Mutex<Option<StopFn>>,
}

impl StopHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Mutex::new(Some(Box::new(stop))),
        }
    }

    pub fn stop(&self) {
        let stop = match self.stop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(stop) = stop {
            stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self.stop.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
