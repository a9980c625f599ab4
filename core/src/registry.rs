//! Process-scoped defaults and the shared cookie jar.
//!
//! # Design
//! Applications build a [`Registry`] and hand it to the clients they create,
//! or use the process-wide one through [`Registry::init_once`] /
//! [`Registry::global`]. The default settings sit behind a mutex and are
//! copied into each client at construction. The cookie jar is created the
//! first time a cookie-enabled client dispatches; `OnceLock` guarantees a
//! single construction, and once built it is read without further locking.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::debug;

use crate::client::HttpClient;
use crate::cookies::CookieJar;
use crate::settings::Settings;

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

#[derive(Debug, Default)]
pub struct Registry {
    initial: Settings,
    defaults: Mutex<Settings>,
    cookie_jar: OnceLock<CookieJar>,
}

impl Registry {
    pub fn new(defaults: Settings) -> Arc<Self> {
        Arc::new(Self {
            initial: defaults.clone(),
            defaults: Mutex::new(defaults),
            cookie_jar: OnceLock::new(),
        })
    }

    /// Initialize the process-wide registry. Later calls return the existing
    /// registry and ignore `defaults`.
    pub fn init_once(defaults: Settings) -> Arc<Self> {
        let mut fresh = Some(defaults);
        let registry = GLOBAL.get_or_init(|| Registry::new(fresh.take().unwrap_or_default()));
        if fresh.is_some() {
            debug!("global registry already initialized");
        }
        Arc::clone(registry)
    }

    /// The process-wide registry, initialized with default settings if
    /// nobody called `init_once` first.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Registry::new(Settings::default())))
    }

    pub fn default_settings(&self) -> Settings {
        self.defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the defaults used by clients constructed from now on.
    pub fn set_default_settings(&self, settings: Settings) {
        *self.defaults.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// The shared jar, created on first use.
    pub fn cookie_jar(&self) -> &CookieJar {
        self.cookie_jar.get_or_init(|| {
            debug!("creating shared cookie jar");
            CookieJar::new()
        })
    }

    /// A client for `base_url` carrying a copy of the current defaults.
    pub fn client(self: &Arc<Self>, base_url: &str) -> HttpClient {
        HttpClient::with_registry(Arc::clone(self), base_url)
    }

    /// Drop every stored cookie and put back the settings the registry was
    /// built with, undoing any `set_default_settings` since.
    pub fn shutdown(&self) {
        if let Some(jar) = self.cookie_jar.get() {
            jar.clear();
        }
        self.set_default_settings(self.initial.clone());
        debug!("registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clients_copy_defaults_at_construction() {
        let registry = Registry::new(Settings {
            user_agent: "first".to_string(),
            ..Settings::default()
        });
        let early = registry.client("http://api.test");

        registry.set_default_settings(Settings {
            user_agent: "second".to_string(),
            ..Settings::default()
        });
        let late = registry.client("http://api.test");

        assert_eq!(early.settings().user_agent, "first");
        assert_eq!(late.settings().user_agent, "second");
    }

    #[test]
    fn cookie_jar_is_created_once() {
        let registry = Registry::new(Settings::default());
        let a = registry.cookie_jar() as *const CookieJar;
        let b = registry.cookie_jar() as *const CookieJar;
        assert_eq!(a, b);
    }

    #[test]
    fn concurrent_jar_access_sees_one_jar() {
        let registry = Registry::new(Settings::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.cookie_jar() as *const CookieJar as usize)
            })
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn shutdown_restores_construction_defaults() {
        let registry = Registry::new(Settings {
            connect_timeout: Duration::from_secs(1),
            ..Settings::default()
        });
        registry.set_default_settings(Settings {
            connect_timeout: Duration::from_secs(9),
            ..Settings::default()
        });
        registry.shutdown();
        assert_eq!(registry.default_settings().connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn global_registry_is_a_singleton() {
        let a = Registry::global();
        let b = Registry::init_once(Settings::default());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
