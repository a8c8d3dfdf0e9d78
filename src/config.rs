use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DetError;
use crate::session::Session;

pub const DEFAULT_MASTER: &str = "http://localhost:8080";
pub const MASTER_ENV: &str = "DET_MASTER";
pub const USER_ENV: &str = "DET_USER";
pub const TOKEN_ENV: &str = "DET_USER_TOKEN";

/// On-disk token store written by the platform's login command.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AuthFile {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub masters: BTreeMap<String, MasterAuth>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MasterAuth {
    #[serde(default)]
    pub active_user: Option<String>,
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

impl AuthFile {
    pub fn token_for(&self, master: &Url, user: Option<&str>) -> Option<String> {
        let entry = self.masters.iter().find_map(|(address, auth)| {
            ConfigLoader::normalize_master(address)
                .ok()
                .filter(|candidate| candidate == master)
                .map(|_| auth)
        })?;
        let user = user.or(entry.active_user.as_deref())?;
        entry.tokens.get(user).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub master: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub master: Url,
    pub user: Option<String>,
    pub token: Option<String>,
}

impl ResolvedConfig {
    pub fn session(&self) -> Session {
        Session::new(self.master.clone(), self.token.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(overrides: &ConfigOverrides) -> Result<ResolvedConfig, DetError> {
        let auth_path = default_auth_path();
        Self::resolve_with(overrides, read_env, auth_path.as_deref())
    }

    pub fn resolve_with<F>(
        overrides: &ConfigOverrides,
        env: F,
        auth_path: Option<&Path>,
    ) -> Result<ResolvedConfig, DetError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_master = overrides
            .master
            .clone()
            .or_else(|| env(MASTER_ENV))
            .unwrap_or_else(|| DEFAULT_MASTER.to_string());
        let master = Self::normalize_master(&raw_master)?;
        let user = overrides.user.clone().or_else(|| env(USER_ENV));

        let token = match env(TOKEN_ENV) {
            Some(token) => Some(token),
            None => match auth_path {
                Some(path) => Self::load_auth_file(path)?
                    .and_then(|auth| auth.token_for(&master, user.as_deref())),
                None => None,
            },
        };

        tracing::debug!(
            master = %master,
            user = user.as_deref().unwrap_or("<active>"),
            has_token = token.is_some(),
            "resolved master configuration"
        );

        Ok(ResolvedConfig {
            master,
            user,
            token,
        })
    }

    /// Accepts `host:port`, `http://host:port` or a URL with a path prefix.
    /// The result always ends in `/` so endpoint joins keep the prefix.
    pub fn normalize_master(raw: &str) -> Result<Url, DetError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DetError::InvalidMaster(raw.to_string()));
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        let mut url =
            Url::parse(&with_scheme).map_err(|err| DetError::InvalidMaster(format!("{raw}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(DetError::InvalidMaster(raw.to_string()));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn load_auth_file(path: &Path) -> Result<Option<AuthFile>, DetError> {
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(path).map_err(|_| DetError::AuthFileRead(path.to_path_buf()))?;
        let auth: AuthFile = serde_json::from_str(&content)
            .map_err(|err| DetError::AuthFileParse(err.to_string()))?;
        Ok(Some(auth))
    }
}

pub fn default_auth_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".determined").join("auth.json"))
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
