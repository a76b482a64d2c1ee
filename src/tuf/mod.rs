//! TUF Client (C1): fetches and validates root/timestamp/snapshot/targets;
//! persists trusted metadata; exposes the current Target set filtered by
//! hardware-id and tag.

pub mod client;
pub mod metadata;

pub use client::{RepoSource, TufClient};
pub use metadata::{Role, SignedEnvelope};
