/// Worker identities are free-form strings such as `worker-3`.
pub type WorkerId = String;

/// Session identities are assigned by the coordinator.
pub type SessionId = String;
