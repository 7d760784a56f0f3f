//! Proxy registration through environment variables
//!
//! Affects this process and the children it spawns afterwards, except the
//! delegated processes (`kubectl`, the full-tunnel helper), which are started
//! without these variables. The environment is written once, when routing is
//! activated; the registry lock serializes it against other registrations.

use super::{ProxyRegistry, ProxyRevert, ProxySettings};
use crate::common::process::PROXY_ENV_KEYS;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::env;
use tracing::{debug, info};

const PROXY_KEYS: &[&str] = &["http_proxy", "https_proxy", "all_proxy"];
const NO_PROXY_KEY: &str = "no_proxy";

#[derive(Debug, Default)]
pub struct EnvProxyRegistry {
    // serializes read-modify-write of the environment
    lock: Mutex<()>,
}

impl EnvProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn all_keys() -> impl Iterator<Item = String> {
        PROXY_ENV_KEYS.iter().map(|k| k.to_string())
    }
}

#[async_trait]
impl ProxyRegistry for EnvProxyRegistry {
    async fn apply(&self, settings: &ProxySettings) -> Result<ProxyRevert> {
        let _guard = self.lock.lock();
        let previous: Vec<(String, Option<String>)> = Self::all_keys()
            .map(|key| {
                let value = env::var(&key).ok();
                (key, value)
            })
            .collect();

        let url = settings.url();
        for key in PROXY_KEYS {
            env::set_var(key, &url);
            env::set_var(key.to_uppercase(), &url);
        }
        let bypass = settings.bypass.join(",");
        env::set_var(NO_PROXY_KEY, &bypass);
        env::set_var(NO_PROXY_KEY.to_uppercase(), &bypass);

        info!("Proxy {} registered (bypass: {})", url, bypass);
        Ok(ProxyRevert { previous })
    }

    async fn revert(&self, token: ProxyRevert) -> Result<()> {
        let _guard = self.lock.lock();
        for (key, value) in token.previous {
            match value {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }
        debug!("Proxy environment restored");
        Ok(())
    }
}
