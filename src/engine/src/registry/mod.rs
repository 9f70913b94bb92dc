//! Registry v2 transport: push and pull of cluster images, plus the
//! default saver for embedded container images.

pub mod auth;
pub mod client;
mod pull;
mod push;
mod saver;

pub use auth::Credentials;
pub use client::{Descriptor, Manifest, RegistryClient, CONFIG_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};
pub use pull::Puller;
pub use push::Pusher;
pub use saver::RegistrySaver;
