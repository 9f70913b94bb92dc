//! Cluster-image engine.
//!
//! A cluster image is to a cluster what a container image is to a
//! process: an immutable, content-addressed, layered bundle whose payload
//! is a complete root filesystem plus the manifests, charts, image lists,
//! and lifecycle assets needed to instantiate a Kubernetes cluster.
//!
//! The crate is organised around three concerns:
//!
//! - **Store** — content-addressed layers ([`store::LayerStore`]), image
//!   manifests and the name index ([`store::ImageStore`]), overlay
//!   composition ([`mount`]).
//! - **Build** — the Clusterfile parser, chain-id cache, and instruction
//!   executors ([`build`]), plus the embedded-image harvester
//!   ([`harvest`]).
//! - **Transport** — the registry v2 push/pull client ([`registry`]).

pub mod archive;
pub mod build;
pub mod digest;
pub mod harvest;
pub mod image;
pub mod mount;
pub mod reference;
pub mod registry;
pub mod store;

pub use build::{BuildEngine, BuildOutcome, BuildRequest};
pub use image::{Image, LayerRef};
pub use reference::ImageReference;
pub use registry::{Credentials, Puller, Pusher};
pub use store::{ImageStore, LayerStore};
