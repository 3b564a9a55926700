//! Drydock Access Control
//!
//! The access-controller interface the dispatcher calls before touching the
//! registry, plus three controllers: `silly` (header presence, for tests and
//! development), `htpasswd` (basic auth against argon2 hashes), and `token`
//! (JWT bearer tokens carrying repository scopes).

pub mod access;
pub mod error;
pub mod htpasswd;
pub mod silly;
pub mod token;

pub use access::{Access, AccessController, Action, Grant, Resource};
pub use error::AuthError;
pub use htpasswd::HtpasswdAccessController;
pub use silly::SillyAccessController;
pub use token::{TokenAccessController, hash_password};
