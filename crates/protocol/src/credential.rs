//! Account credentials and entitlement.

use serde::{Deserialize, Serialize};

/// Stored cloud credential of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds at which the access token expires, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }
}

/// Body returned by the token refresh endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Converts a successful refresh into the credential to store.
    ///
    /// The service may omit the refresh token, in which case the previous one
    /// stays valid. Returns the error text when the refresh was refused.
    pub fn into_credential(self, previous: &Credential, now_secs: u64) -> Result<Credential, String> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Err(match self.error_description {
                Some(desc) => format!("{error}: {desc}"),
                None => error,
            });
        }
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "refresh response carried no access token".to_string())?;
        Ok(Credential {
            access_token,
            refresh_token: self
                .refresh_token
                .unwrap_or_else(|| previous.refresh_token.clone()),
            expires_at: self.expires_in.map(|ttl| now_secs + ttl),
        })
    }
}

/// Subscription tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "lowercase")]
pub enum Entitlement {
    Basic,
    /// Premium until `expires_at` (unix seconds).
    Premium { expires_at: u64 },
}

impl Entitlement {
    /// Derives the tier from the profile's `pro` epoch.
    pub fn from_pro(pro: Option<u64>, now_secs: u64) -> Self {
        match pro {
            Some(expires_at) if expires_at > now_secs => Entitlement::Premium { expires_at },
            _ => Entitlement::Basic,
        }
    }

    /// Whether fence actions may run at `now_secs`.
    pub fn allows_actions(&self, now_secs: u64) -> bool {
        matches!(self, Entitlement::Premium { expires_at } if *expires_at > now_secs)
    }
}

/// Subset of `/user/profile` read by the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub pro: Option<u64>,
}
