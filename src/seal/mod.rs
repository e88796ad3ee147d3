//! # Threshold Seal
//!
//! The secret store starts every process sealed. A master key generated at
//! initialization is split into `N` shares with threshold `M`; presenting any `M`
//! distinct shares reconstructs it and unseals the store, while `M - 1` shares
//! reveal nothing about it.
//!
//! The master key is the only key for the [`Barrier`] that encrypts persisted
//! credential history and CA state, so it never touches disk. Shares live in the
//! operator's `keys.json` backup; if that file and enough of its copies are lost,
//! the store cannot be recovered.

pub mod barrier;
pub mod keyfile;
pub mod manager;
pub mod shamir;

pub use barrier::{Barrier, MasterKey, SealedBlob};
pub use keyfile::{KeyBackup, SealMetadata};
pub use manager::{Initialization, SealManager, SealState, SealStatus};
pub use shamir::Share;
