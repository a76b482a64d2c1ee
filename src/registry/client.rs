//! OCI distribution v2 client (spec.md §4.5), structured the way the
//! teacher's `registry::client::RegistryClient` wraps a shared `reqwest`
//! client, generalized to the bearer-auth flow and streaming digest
//! verification the spec requires. Blocking by design: spec.md §5
//! describes a single-threaded, cooperative core where blocking network
//! I/O is explicit rather than routed through an async runtime.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use openssl::hash::{Hasher, MessageDigest};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::credential::CredentialProvider;
use crate::error::RegistryError;
use crate::flow::FlowControl;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct RegistryClient {
    client: Arc<Client>,
    credentials: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Clone)]
struct BearerChallenge {
    realm: String,
    service: String,
    scope: String,
}

impl RegistryClient {
    pub fn new(client: Arc<Client>, credentials: Arc<dyn CredentialProvider>) -> Self {
        RegistryClient { client, credentials }
    }

    /// GET `/v2/<repo>/manifests/<digest>`; the response body's SHA-256
    /// must equal `digest`. Mismatched-size responses also fail.
    #[instrument(skip(self, flow))]
    pub fn get_manifest(
        &self,
        registry_host: &str,
        repo: &str,
        digest: &str,
        flow: &FlowControl,
    ) -> Result<Vec<u8>, RegistryError> {
        flow.check_registry()?;
        let url = format!("https://{registry_host}/v2/{repo}/manifests/{digest}");
        let resp = self.send_authenticated(registry_host, repo, self.client.get(&url))?;
        let bytes = resp.bytes().map(|b| b.to_vec()).map_err(|e| RegistryError::Transport {
            what: url.clone(),
            source: e.into(),
        })?;
        verify_digest("manifest", digest, &bytes)?;
        Ok(bytes)
    }

    /// GETs the blob at `digest`, streaming to a temp file under
    /// `blobs_dir` while updating a SHA-256 hasher; on success the file is
    /// renamed to `<hash>`. Any in-transit read exceeding the declared size
    /// aborts the transfer.
    #[instrument(skip(self, flow))]
    pub fn download_blob(
        &self,
        registry_host: &str,
        repo: &str,
        digest: &str,
        blobs_dir: &Utf8Path,
        declared_size: Option<u64>,
        flow: &FlowControl,
    ) -> Result<camino::Utf8PathBuf, RegistryError> {
        flow.check_registry()?;
        let hex_digest = digest.strip_prefix("sha256:").unwrap_or(digest);
        let dest = blobs_dir.join(hex_digest);
        if dest.exists() {
            debug!(digest, "blob already present, skipping download");
            return Ok(dest);
        }

        let url = format!("https://{registry_host}/v2/{repo}/blobs/{digest}");
        let mut resp = self.send_authenticated(registry_host, repo, self.client.get(&url))?;

        let mut hasher = Hasher::new(MessageDigest::sha256()).map_err(|e| transport_err(digest, e))?;

        std::fs::create_dir_all(blobs_dir).map_err(|e| transport_err(digest, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(blobs_dir).map_err(|e| transport_err(digest, e))?;

        let mut buf = [0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            flow.check_registry()?;
            let n = std::io::Read::read(&mut resp, &mut buf).map_err(|e| transport_err(digest, e))?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if let Some(declared) = declared_size {
                if written > declared {
                    return Err(RegistryError::SizeExceeded {
                        what: digest.to_string(),
                    });
                }
            }
            hasher.update(&buf[..n]).map_err(|e| transport_err(digest, e))?;
            tmp.write_all(&buf[..n]).map_err(|e| transport_err(digest, e))?;
        }

        let computed = hex::encode(hasher.finish().map_err(|e| transport_err(digest, e))?);
        if computed != hex_digest {
            drop(tmp);
            return Err(RegistryError::VerificationFailed {
                what: digest.to_string(),
                expected: hex_digest.to_string(),
                actual: computed,
            });
        }

        tmp.persist(&dest).map_err(|e| RegistryError::Transport {
            what: digest.to_string(),
            source: e.error.into(),
        })?;
        Ok(dest)
    }

    /// Issues `req` with no auth first; on HTTP 401 parses the
    /// `WWW-Authenticate` challenge, exchanges basic-auth credentials from
    /// `CredentialProvider` for a bearer token, and retries once with it.
    /// Transport errors are retried up to `MAX_RETRIES` times with
    /// exponential backoff; only `bearer` challenges are supported.
    fn send_authenticated(
        &self,
        registry_host: &str,
        repo: &str,
        req: RequestBuilder,
    ) -> Result<Response, RegistryError> {
        let mut attempt = 0u32;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let built = req.try_clone().ok_or_else(|| RegistryError::Transport {
                what: "request".into(),
                source: anyhow::anyhow!("request body not cloneable for retry"),
            })?;

            match built.send() {
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    let challenge = parse_bearer_challenge(&resp)?;
                    let token = self.exchange_token(registry_host, repo, &challenge)?;
                    let retried = req
                        .try_clone()
                        .ok_or_else(|| RegistryError::Transport {
                            what: "request".into(),
                            source: anyhow::anyhow!("request body not cloneable for retry"),
                        })?
                        .bearer_auth(token)
                        .send()
                        .map_err(|e| RegistryError::Transport {
                            what: "authenticated request".into(),
                            source: e.into(),
                        })?;
                    return Ok(retried);
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %e, "registry request failed, retrying");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(RegistryError::Transport {
                        what: "request".into(),
                        source: e.into(),
                    })
                }
            }
        }
    }

    fn exchange_token(
        &self,
        registry_host: &str,
        repo: &str,
        challenge: &BearerChallenge,
    ) -> Result<String, RegistryError> {
        let mut req = self
            .client
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str()), ("scope", challenge.scope.as_str())]);
        if let Some((user, pass)) = self.credentials.basic_auth_for(registry_host) {
            req = req.basic_auth(user, Some(pass));
        }
        let _ = repo;

        let resp = req.send().map_err(|e| RegistryError::AuthFailed(e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .map_err(|e| RegistryError::AuthFailed(format!("malformed token response: {e}")))?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RegistryError::AuthFailed("token response missing token field".into()))
    }
}

fn transport_err(what: &str, e: impl Into<anyhow::Error>) -> RegistryError {
    RegistryError::Transport {
        what: what.to_string(),
        source: e.into(),
    }
}

fn parse_bearer_challenge(resp: &Response) -> Result<BearerChallenge, RegistryError> {
    let header = resp
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryError::UnsupportedAuthScheme("missing WWW-Authenticate header".into()))?;

    let Some(rest) = header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer ")) else {
        return Err(RegistryError::UnsupportedAuthScheme(header.to_string()));
    };

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('"');
            match key {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(BearerChallenge {
        realm: realm.ok_or_else(|| RegistryError::AuthFailed("challenge missing realm".into()))?,
        service: service.unwrap_or_default(),
        scope: scope.unwrap_or_default(),
    })
}

fn verify_digest(what: &str, expected_digest: &str, bytes: &[u8]) -> Result<(), RegistryError> {
    let expected_hex = expected_digest.strip_prefix("sha256:").unwrap_or(expected_digest);
    let mut hasher = Hasher::new(MessageDigest::sha256()).map_err(|e| transport_err(what, e))?;
    hasher.update(bytes).map_err(|e| transport_err(what, e))?;
    let actual = hex::encode(hasher.finish().map_err(|e| transport_err(what, e))?);
    if actual != expected_hex {
        return Err(RegistryError::VerificationFailed {
            what: what.to_string(),
            expected: expected_hex.to_string(),
            actual,
        });
    }
    Ok(())
}
