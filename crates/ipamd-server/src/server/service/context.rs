use crate::server::shutdown::TerminationState;
use ipamd_core::{AllocationStore, NetworkRangeProvider};
use std::sync::Arc;

/// Everything the RPC service needs from the surrounding daemon.
///
/// The termination state is created here, so every clone of the context
/// observes the same flag.
#[derive(Clone)]
pub struct IpamContext {
    store: Arc<dyn AllocationStore>,
    ranges: Arc<dyn NetworkRangeProvider>,
    termination: TerminationState,
}

impl IpamContext {
    pub fn new(store: Arc<dyn AllocationStore>, ranges: Arc<dyn NetworkRangeProvider>) -> Self {
        Self {
            store,
            ranges,
            termination: TerminationState::new(),
        }
    }

    pub fn store(&self) -> &dyn AllocationStore {
        self.store.as_ref()
    }

    pub fn ranges(&self) -> &dyn NetworkRangeProvider {
        self.ranges.as_ref()
    }

    pub const fn termination(&self) -> &TerminationState {
        &self.termination
    }

    pub fn is_terminating(&self) -> bool {
        self.termination.is_terminating()
    }
}
