//! Bearer-token credentials loaded from a service-account key file.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::auth::CloudAuth;
use crate::error::{CloudError, Result};

#[derive(Deserialize)]
struct KeyFile {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default)]
    client_email: Option<String>,
}

/// Sends `Authorization: Bearer <token>` on every request.
#[derive(Clone)]
pub struct ServiceAccountAuth {
    token: String,
    account: Option<String>,
}

impl std::fmt::Debug for ServiceAccountAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountAuth")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            account: None,
        }
    }

    /// Load a JSON key file holding `access_token` (or `token`) and
    /// optionally `client_email`.
    ///
    /// A missing or malformed file is a configuration error.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CloudError::Configuration(format!(
                "service account file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let key: KeyFile = serde_json::from_str(&text).map_err(|e| {
            CloudError::Configuration(format!("invalid service account file {}: {}", path.display(), e))
        })?;
        if key.access_token.trim().is_empty() {
            return Err(CloudError::Configuration(format!(
                "service account file {} has an empty token",
                path.display()
            )));
        }

        debug!(account = ?key.client_email, "loaded service account");
        Ok(Self {
            token: key.access_token.trim().to_string(),
            account: key.client_email,
        })
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }
}

impl CloudAuth for ServiceAccountAuth {
    fn sign_request(
        &self,
        _url: &str,
        _method: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Result<()> {
        headers.push(("Authorization".to_string(), format!("Bearer {}", self.token)));
        Ok(())
    }
}
