use jobrelay_core::OwnerHash;

/// Owner context for a request.
///
/// Resolved by the auth middleware before any handler runs; the engine only
/// ever sees this, never the presented credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner: OwnerHash,
}

impl OwnerContext {
    pub fn new(owner: OwnerHash) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> &OwnerHash {
        &self.owner
    }
}
