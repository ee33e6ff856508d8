// =============================================================================
// Contest module — lifecycle, replay clock, leaderboard, cleanup
// =============================================================================

pub mod cleanup;
pub mod clock;
pub mod controller;
pub mod leaderboard;

use parking_lot::RwLock;

use crate::types::ContestStatus;

/// The one place contest status lives. Written only by the controller; read
/// by the trade executor's gate and the API. Readers always see a whole
/// status, never a torn transition.
pub struct ContestGate {
    status: RwLock<ContestStatus>,
}

impl ContestGate {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(ContestStatus::Idle),
        }
    }

    pub fn status(&self) -> ContestStatus {
        *self.status.read()
    }

    pub fn set(&self, status: ContestStatus) {
        *self.status.write() = status;
    }

    pub fn is_running(&self) -> bool {
        self.status() == ContestStatus::Running
    }
}

impl Default for ContestGate {
    fn default() -> Self {
        Self::new()
    }
}
