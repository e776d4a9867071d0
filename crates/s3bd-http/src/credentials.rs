//! Credential providers
//!
//! The store signs every request with whatever the injected provider hands
//! out. Static keys cover the common case; on EC2 the IAM-role provider
//! polls the instance metadata service and refreshes ahead of expiry on a
//! background schedule.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::{debug, info, warn};

use s3bd_common::{Error, Result};

/// One set of signing credentials
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Source of current credentials
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

/// Fixed keys from configuration
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    #[must_use]
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self(Credentials {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token,
        })
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Instance metadata response for one role
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: String,
    expiration: String,
}

struct CachedCredentials {
    credentials: Credentials,
    expiration: DateTime<Utc>,
}

struct RefreshControl {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// IAM-role credentials from the EC2 instance metadata service,
/// refreshed ahead of expiry by a dedicated thread.
pub struct IamRoleProvider {
    role: String,
    endpoint: String,
    client: reqwest::blocking::Client,
    cached: Mutex<Option<CachedCredentials>>,
    control: Arc<RefreshControl>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

/// Default instance metadata endpoint
const METADATA_ENDPOINT: &str = "http://169.254.169.254";

/// How often the refresher re-checks when nothing is close to expiry
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Credentials are refreshed this long before they expire
fn refresh_margin() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

impl IamRoleProvider {
    /// Create the provider and start its refresh thread. `endpoint`
    /// overrides the instance metadata address (used by tests).
    pub fn new(role: impl Into<String>, endpoint: Option<String>) -> Result<Arc<Self>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Io(format!("build metadata client: {e}")))?;

        let provider = Arc::new(Self {
            role: role.into(),
            endpoint: endpoint.unwrap_or_else(|| METADATA_ENDPOINT.to_string()),
            client,
            cached: Mutex::new(None),
            control: Arc::new(RefreshControl {
                stop: Mutex::new(false),
                wake: Condvar::new(),
            }),
            refresher: Mutex::new(None),
        });

        let handle = {
            let provider = Arc::clone(&provider);
            std::thread::Builder::new()
                .name("s3bd-iam-refresh".to_string())
                .spawn(move || provider.refresh_loop())
                .map_err(|e| Error::Io(format!("spawn credential refresher: {e}")))?
        };
        *provider.refresher.lock() = Some(handle);
        Ok(provider)
    }

    fn refresh_loop(&self) {
        let mut stop = self.control.stop.lock();
        while !*stop {
            let due = {
                let cached = self.cached.lock();
                match cached.as_ref() {
                    None => true,
                    Some(c) => Utc::now() + refresh_margin() >= c.expiration,
                }
            };
            if due {
                drop(stop);
                match self.fetch() {
                    Ok(fresh) => {
                        info!(role = %self.role, "refreshed IAM role credentials");
                        *self.cached.lock() = Some(fresh);
                    }
                    Err(e) => warn!("IAM credential refresh failed: {e}"),
                }
                stop = self.control.stop.lock();
            }
            let _ = self
                .control
                .wake
                .wait_for(&mut stop, REFRESH_CHECK_INTERVAL);
        }
    }

    fn fetch(&self) -> Result<CachedCredentials> {
        let url = format!(
            "{}/latest/meta-data/iam/security-credentials/{}",
            self.endpoint, self.role
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::Auth(format!("instance metadata request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Auth(format!(
                "instance metadata returned {} for role {}",
                resp.status(),
                self.role
            )));
        }
        let raw = resp
            .bytes()
            .map_err(|e| Error::Auth(format!("read credential document: {e}")))?;
        let body: RoleCredentials = serde_json::from_slice(&raw)
            .map_err(|e| Error::Auth(format!("malformed credential document: {e}")))?;
        let expiration = DateTime::parse_from_rfc3339(&body.expiration)
            .map_err(|e| Error::Auth(format!("bad credential expiration: {e}")))?
            .with_timezone(&Utc);
        debug!(role = %self.role, %expiration, "fetched role credentials");
        Ok(CachedCredentials {
            credentials: Credentials {
                access_key: body.access_key_id,
                secret_key: body.secret_access_key,
                session_token: Some(body.token),
            },
            expiration,
        })
    }
}

impl CredentialsProvider for IamRoleProvider {
    fn credentials(&self) -> Result<Credentials> {
        {
            let cached = self.cached.lock();
            if let Some(c) = cached.as_ref() {
                if Utc::now() < c.expiration {
                    return Ok(c.credentials.clone());
                }
            }
        }
        // Cache empty or expired; fetch inline rather than fail the
        // operation while the refresher is between checks.
        let fresh = self.fetch()?;
        let creds = fresh.credentials.clone();
        *self.cached.lock() = Some(fresh);
        Ok(creds)
    }
}

impl Drop for IamRoleProvider {
    fn drop(&mut self) {
        *self.control.stop.lock() = true;
        self.control.wake.notify_all();
        if let Some(handle) = self.refresher.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider_returns_fixed_keys() {
        let provider = StaticCredentials::new("AKID", "secret", Some("tok".to_string()));
        let creds = provider.credentials().unwrap();
        assert_eq!(creds.access_key, "AKID");
        assert_eq!(creds.secret_key, "secret");
        assert_eq!(creds.session_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials {
            access_key: "AKID".to_string(),
            secret_key: "verysecret".to_string(),
            session_token: Some("tok".to_string()),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("verysecret"));
        assert!(!rendered.contains("tok\""));
    }

    #[test]
    fn test_role_credentials_parse() {
        let doc = r#"{
            "Code": "Success",
            "LastUpdated": "2026-08-01T12:00:00Z",
            "Type": "AWS-HMAC",
            "AccessKeyId": "ASIAEXAMPLE",
            "SecretAccessKey": "secret",
            "Token": "token",
            "Expiration": "2026-08-01T18:00:00Z"
        }"#;
        let parsed: RoleCredentials = serde_json::from_str(doc).unwrap();
        assert_eq!(parsed.access_key_id, "ASIAEXAMPLE");
        assert_eq!(parsed.expiration, "2026-08-01T18:00:00Z");
    }
}
