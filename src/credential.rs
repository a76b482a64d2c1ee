//! `CredentialProvider` capability (spec.md §1): registry authentication
//! brokers are out of scope; the core only consumes basic-auth credentials
//! for the bearer-token exchange (spec.md §4.5).

pub trait CredentialProvider: Send + Sync {
    /// Basic-auth `username:password` for `registry_host`, if any is
    /// configured. `None` means the exchange is attempted unauthenticated.
    fn basic_auth_for(&self, registry_host: &str) -> Option<(String, String)>;
}

/// A provider with no credentials configured, useful for anonymous-pull
/// registries and tests.
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn basic_auth_for(&self, _registry_host: &str) -> Option<(String, String)> {
        None
    }
}
