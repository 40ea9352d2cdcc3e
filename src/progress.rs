use crate::error::EngineError;
use std::sync::{Arc, Mutex};

pub type ProgressCallback = Arc<dyn Fn(InstallProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    pub completed: usize,
    pub total: usize,
    pub detail: Option<String>,
}

impl InstallProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f32 / self.total as f32).clamp(0.0, 1.0)
    }
}

/// Monotonic `completed <= total` counter shared with an observer.
pub struct ProgressTracker {
    total: usize,
    completed: Mutex<usize>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            completed: Mutex::new(0),
            callback,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed.lock().map(|value| *value).unwrap_or(self.total)
    }

    pub fn advance(&self, detail: Option<String>) -> Result<(), EngineError> {
        let completed = {
            let mut completed = self
                .completed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *completed >= self.total {
                return Err(EngineError::ProgressOverflow {
                    completed: *completed + 1,
                    total: self.total,
                });
            }
            *completed += 1;
            *completed
        };
        if let Some(callback) = &self.callback {
            callback(InstallProgress {
                completed,
                total: self.total,
                detail,
            });
        }
        Ok(())
    }
}
