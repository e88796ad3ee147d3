//! # Authentication
//!
//! Two capability levels: an admin token created at initialization, and
//! per-service tokens that can only read their own credentials and wait on
//! their own startup gate. Tokens are stored as SHA-256 hashes.

pub mod middleware;
pub mod tokens;

pub use tokens::{AuthContext, Scope, TokenStore};
