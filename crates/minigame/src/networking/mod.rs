//! Session sync: snapshot interpolation, object authority and the handler
//! routing session diffs into both.

pub mod authority;
pub mod interpolation;
pub mod scene;
pub mod sync;

pub use authority::{AuthorityArbiter, AuthorityClaim, ContactDecision};
pub use interpolation::{
    Correction, Snapshot, SnapshotBuffer, SnapshotInterpolator, velocity_correction,
};
pub use scene::{EntityKind, Scene};
pub use sync::{NetworkSyncHandler, OwnershipMode, TrackedEntity};
