//! JSON-persisted client configuration.
//!
//! `ClientConfig` is the plain-data form of [`Settings`]: only values that
//! can be written to a file. Function-valued settings (proxy resolver,
//! redirect policy, custom transport) are set in code.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::settings::{ProxyResolver, Settings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_WRITE_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub show_debug: bool,
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub read_write_timeout_ms: u64,
    pub enable_cookie: bool,
    pub gzip: bool,
    pub dump_body: bool,
    /// `0` runs once, `n` allows `n` extra attempts, `-1` retries until success.
    pub retries: i32,
    pub retry_deadline_ms: Option<u64>,
    /// Proxy used for every request.
    pub proxy: Option<String>,
    pub insecure_skip_verify: bool,
    pub strict_uploads: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            show_debug: false,
            user_agent: String::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            read_write_timeout_ms: DEFAULT_READ_WRITE_TIMEOUT.as_millis() as u64,
            enable_cookie: false,
            gzip: true,
            dump_body: true,
            retries: 0,
            retry_deadline_ms: None,
            proxy: None,
            insecure_skip_verify: false,
            strict_uploads: false,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::Encoding)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| Error::FileIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|source| Error::FileIo {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn into_settings(self) -> Result<Settings> {
        let mut retries = RetryPolicy::from_count(self.retries)?;
        if let Some(ms) = self.retry_deadline_ms {
            retries = retries.with_deadline(Duration::from_millis(ms));
        }
        let proxy = match self.proxy {
            Some(proxy) => {
                let url = Url::parse(&proxy)
                    .map_err(|e| Error::Config(format!("proxy {proxy:?}: {e}")))?;
                Some(ProxyResolver::fixed(url))
            }
            None => None,
        };
        let tls_config = self.insecure_skip_verify.then(|| {
            ureq::tls::TlsConfig::builder()
                .disable_verification(true)
                .build()
        });

        Ok(Settings {
            show_debug: self.show_debug,
            user_agent: self.user_agent,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_write_timeout: Duration::from_millis(self.read_write_timeout_ms),
            tls_config,
            proxy,
            transport: None,
            check_redirect: None,
            enable_cookie: self.enable_cookie,
            gzip: self.gzip,
            dump_body: self.dump_body,
            retries,
            strict_uploads: self.strict_uploads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Attempts;

    #[test]
    fn empty_object_gives_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());

        let settings = config.into_settings().unwrap();
        assert_eq!(settings.connect_timeout, Duration::from_secs(60));
        assert_eq!(settings.read_write_timeout, Duration::from_secs(60));
        assert!(settings.gzip);
        assert!(settings.dump_body);
        assert!(!settings.enable_cookie);
        assert_eq!(settings.retries.attempts, Attempts::Limited(0));
    }

    #[test]
    fn fields_map_onto_settings() {
        let config = ClientConfig::from_json(
            r#"{
                "user_agent": "probe/2",
                "connect_timeout_ms": 1500,
                "enable_cookie": true,
                "retries": -1,
                "retry_deadline_ms": 30000,
                "proxy": "http://proxy.test:3128"
            }"#,
        )
        .unwrap();
        let settings = config.into_settings().unwrap();
        assert_eq!(settings.user_agent, "probe/2");
        assert_eq!(settings.connect_timeout, Duration::from_millis(1500));
        assert!(settings.enable_cookie);
        assert_eq!(settings.retries.attempts, Attempts::Unbounded);
        assert_eq!(settings.retries.deadline, Some(Duration::from_secs(30)));
        let target = Url::parse("http://api.test/").unwrap();
        assert_eq!(
            settings.proxy.unwrap().resolve(&target).unwrap().as_str(),
            "http://proxy.test:3128/"
        );
    }

    #[test]
    fn rejects_bad_values() {
        let config = ClientConfig {
            retries: -2,
            ..ClientConfig::default()
        };
        assert!(matches!(config.into_settings(), Err(Error::Config(_))));

        let config = ClientConfig {
            proxy: Some("not a url".to_string()),
            ..ClientConfig::default()
        };
        assert!(matches!(config.into_settings(), Err(Error::Config(_))));

        assert!(matches!(ClientConfig::from_json("[1]"), Err(Error::Config(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        let config = ClientConfig {
            show_debug: true,
            retries: 3,
            ..ClientConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn load_missing_file_is_file_io() {
        assert!(matches!(
            ClientConfig::load("/no/such/client.json"),
            Err(Error::FileIo { .. })
        ));
    }
}
