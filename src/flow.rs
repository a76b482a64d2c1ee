//! Cooperative cancellation (spec.md §5): long-running loops poll a
//! `FlowControl` token between chunks/items and exit cleanly at the next
//! boundary. There is no forced cancellation.

use tokio_util::sync::CancellationToken;

use crate::error::{InstallError, RegistryError, TufError};

/// A cheaply-cloneable cancellation token passed down into blob downloads,
/// commit pulls, and per-app fetch iterations.
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    token: CancellationToken,
}

impl FlowControl {
    pub fn new() -> Self {
        FlowControl {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Call at a loop boundary; returns early with `Cancelled` if requested.
    pub fn check_tuf(&self) -> Result<(), TufError> {
        if self.is_cancelled() {
            return Err(TufError::Cancelled);
        }
        Ok(())
    }

    pub fn check_registry(&self) -> Result<(), RegistryError> {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        Ok(())
    }

    pub fn check_install(&self) -> Result<(), InstallError> {
        if self.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        Ok(())
    }

    pub fn child(&self) -> FlowControl {
        FlowControl {
            token: self.token.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_observed_at_next_boundary() {
        let flow = FlowControl::new();
        assert!(flow.check_registry().is_ok());
        flow.cancel();
        assert!(matches!(flow.check_registry(), Err(RegistryError::Cancelled)));
    }

    #[test]
    fn child_token_inherits_parent_cancellation() {
        let parent = FlowControl::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
