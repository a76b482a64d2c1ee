//! Registry Client (C5): speaks the OCI distribution protocol — bearer
//! token acquisition, manifest GET with digest check, blob download with
//! streaming SHA-256 check.

pub mod client;

pub use client::RegistryClient;
