use url::Url;

use crate::error::DetError;

/// Master address plus the bearer token every authenticated call carries.
#[derive(Debug, Clone)]
pub struct Session {
    master: Url,
    token: Option<String>,
}

impl Session {
    pub fn new(master: Url, token: Option<String>) -> Self {
        let token = token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self { master, token }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn require_token(&self) -> Result<&str, DetError> {
        self.token()
            .ok_or_else(|| DetError::NotLoggedIn(self.master.to_string()))
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, DetError> {
        self.master
            .join(path.trim_start_matches('/'))
            .map_err(|err| DetError::InvalidMaster(format!("{}: {err}", self.master)))
    }
}
