//! Drydock Upstream Client
//!
//! This crate provides the HTTP client the pull-through cache controller uses
//! to talk to an upstream registry: token-dance authentication, manifest
//! fetches, and streaming blob downloads.

pub mod client;
pub mod error;

pub use client::{RemoteClient, RemoteConfig};
pub use error::ProxyError;
