//! Drydock Registry Core
//!
//! Content-addressed storage engine for an OCI/Docker v2 image registry:
//! blob store, resumable uploads, manifest ingest, tag index, descriptor
//! caching, and the pull-through cache controller. Everything durable goes
//! through the `drydock-storage` driver contract.

pub mod blob;
pub mod cache;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod events;
pub mod manifest;
pub mod proxy;
pub mod purge;
pub mod reference;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod tags;
pub mod upload;

pub use blob::{BlobStore, LinkedBlobStore};
pub use cache::{BlobDescriptorCache, InMemoryDescriptorCache, RedisDescriptorCache};
pub use descriptor::{Descriptor, Platform};
pub use digest::{Algorithm, Digest, Digester};
pub use error::CoreError;
pub use events::{Broadcaster, Endpoint, Event, EventAction, spawn_delivery_worker};
pub use manifest::{ManifestPolicy, ManifestStore, PlatformPolicy};
pub use proxy::ProxyRegistry;
pub use purge::{UploadPurgeConfig, spawn_upload_purger};
pub use reference::{ManifestRef, RepositoryName, Tag};
pub use registry::{Registry, RegistryConfig};
pub use scheduler::{ProxyScheduler, spawn_ttl_scheduler};
pub use services::{
    BlobService, CatalogPage, ManifestService, Namespace, Repository, StoredManifest, TagService,
    UploadService, UploadSessionInfo,
};
pub use tags::TagStore;
pub use upload::UploadManager;
