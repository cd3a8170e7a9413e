use std::sync::Arc;

/// Lifecycle notifications emitted while a closure is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    FetchStarted { name: String, url: String },
    FetchCompleted { name: String },
    InstallStarted { name: String, from_source: bool },
    StepStarted { name: String, step: usize, total: usize, description: String },
    InstallCompleted { name: String },
    AlreadySatisfied { name: String },
    Failed { name: String, reason: String },
    Skipped { name: String, dependency: String },
    TestStarted { name: String },
    TestCompleted { name: String, passed: bool },
}

impl InstallEvent {
    pub fn name(&self) -> &str {
        match self {
            InstallEvent::FetchStarted { name, .. }
            | InstallEvent::FetchCompleted { name }
            | InstallEvent::InstallStarted { name, .. }
            | InstallEvent::StepStarted { name, .. }
            | InstallEvent::InstallCompleted { name }
            | InstallEvent::AlreadySatisfied { name }
            | InstallEvent::Failed { name, .. }
            | InstallEvent::Skipped { name, .. }
            | InstallEvent::TestStarted { name }
            | InstallEvent::TestCompleted { name, .. } => name,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(InstallEvent) + Send + Sync>;

/// Invoke an optional callback.
pub(crate) fn emit(progress: &Option<ProgressCallback>, event: InstallEvent) {
    if let Some(cb) = progress {
        cb(event);
    }
}
