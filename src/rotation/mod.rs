//! # Rotation Scheduler
//!
//! Tracks every credential record and every active leaf of a TLS-enabled
//! service. An item becomes `Due` when less than the rotation threshold of its
//! validity remains; a rollout writes the replacement, restarts the affected
//! services downstream-inclusive, and only then retires what it replaced.
//!
//! A restart that never reports healthy sends the item back to `Due`, raises a
//! critical alert and marks the service `credentials_degraded`. The prior
//! version stays fetchable.

pub mod policy;
pub mod scheduler;

pub use policy::{Alert, AlertSeverity, Assessment, ItemKind, RotationPolicy, RotationState};
pub use scheduler::{CycleReport, RotationScheduler, ServiceRotation, TrackedItem};
