//! OCI Distribution registry client.
//!
//! Reference parsing with Docker-compatible normalisation, bearer/basic
//! authentication with a per-client token cache, and manifest/blob/tag
//! operations in both async ([`Client`]) and blocking ([`BlockingClient`])
//! form.  This crate knows nothing about component descriptors; the `ocm`
//! crate builds on it.

// downstream crates build collaborator clients on the same HTTP stacks
pub use {reqwest, ureq};

pub mod auth;
pub mod blocking;
pub mod client;
pub mod error;
pub mod platform;
pub mod reference;

pub use auth::{Credentials, CredentialsSource, Privilege, StaticCredentials};
pub use blocking::BlockingClient;
pub use client::{sha256_digest, Client, ClientConfig, Protocol, RawManifest};
pub use error::{Error, Result};
pub use platform::Platform;
pub use reference::{ImageReference, Tag};
