use forkpool_manager::CacheBranchManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: CacheBranchManager,
}

impl AppState {
    pub fn new(manager: CacheBranchManager) -> Self {
        Self { manager }
    }
}
