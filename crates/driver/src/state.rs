//! The state module holds the [ActiveDisputes] registry, which is shared between all drivers.

use ethers::types::Address;
use rollup_challenger_protocol::bisection::Party;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

/// The [ActiveDisputes] registry tracks which challenges this process is currently playing, so
/// that no challenge is played twice from the same side.
#[derive(Debug, Clone, Default)]
pub struct ActiveDisputes {
    inner: Arc<Mutex<HashSet<(Address, Party)>>>,
}

impl ActiveDisputes {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the challenge at `address` for `role`.
    ///
    /// ### Returns
    /// - `Some(DisputeClaim)`: The challenge is ours until the claim is dropped.
    /// - `None`: The challenge is already being played from that side.
    pub fn claim(&self, address: Address, role: Party) -> Option<DisputeClaim> {
        let inserted = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((address, role));

        inserted.then(|| DisputeClaim {
            registry: self.clone(),
            key: (address, role),
        })
    }

    /// Returns true if the challenge at `address` is being played for `role`.
    pub fn is_active(&self, address: Address, role: Party) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(address, role))
    }

    /// Returns the number of challenges being played.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no challenge is being played.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [DisputeClaim] holds an entry of the [ActiveDisputes] registry and releases it on drop.
#[derive(Debug)]
pub struct DisputeClaim {
    registry: ActiveDisputes,
    key: (Address, Party),
}

impl Drop for DisputeClaim {
    fn drop(&mut self) {
        self.registry
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claims_are_exclusive_per_side() {
        let disputes = ActiveDisputes::new();
        let address = Address::repeat_byte(1);

        let claim = disputes.claim(address, Party::Asserter).unwrap();
        assert!(disputes.claim(address, Party::Asserter).is_none());
        // The other side of the same challenge may be played by the same process.
        let other = disputes.claim(address, Party::Challenger).unwrap();
        assert_eq!(disputes.len(), 2);

        drop(claim);
        assert!(!disputes.is_active(address, Party::Asserter));
        assert!(disputes.claim(address, Party::Asserter).is_some());
        drop(other);
        assert!(disputes.is_empty());
    }

    #[test]
    fn clones_share_entries() {
        let disputes = ActiveDisputes::new();
        let _claim = disputes
            .clone()
            .claim(Address::zero(), Party::Challenger)
            .unwrap();
        assert!(disputes.is_active(Address::zero(), Party::Challenger));
    }
}
