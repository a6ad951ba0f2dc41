//! Client profile resolution.
//!
//! A profile bundles concurrency and rate parameters for a class of
//! callers. Resolution priority: the `X-Client` request header, then the
//! tenant's configured profile, then the built-in `default`, which
//! always exists.

use crate::config::ClientProfileConfig;
use std::collections::HashMap;

/// Name of the built-in profile.
pub const DEFAULT_PROFILE: &str = "default";

/// Manages the configured profiles.
#[derive(Debug, Clone)]
pub struct ClientProfileManager {
    profiles: HashMap<String, ClientProfileConfig>,
}

impl ClientProfileManager {
    pub fn new(mut profiles: HashMap<String, ClientProfileConfig>) -> Self {
        profiles
            .entry(DEFAULT_PROFILE.to_string())
            .or_insert_with(ClientProfileConfig::default);
        Self { profiles }
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Resolves the profile name by priority.
    pub fn resolve_name(
        &self,
        header_profile: Option<&str>,
        tenant_profile: Option<&str>,
    ) -> &str {
        if let Some(name) = header_profile {
            if let Some((key, _)) = self.profiles.get_key_value(name) {
                return key;
            }
        }
        if let Some(name) = tenant_profile {
            if let Some((key, _)) = self.profiles.get_key_value(name) {
                return key;
            }
        }
        DEFAULT_PROFILE
    }

    /// Fetches a profile; unknown names resolve to the default.
    pub fn get(&self, name: &str) -> &ClientProfileConfig {
        self.profiles
            .get(name)
            .or_else(|| self.profiles.get(DEFAULT_PROFILE))
            .expect("default profile always exists")
    }
}

impl Default for ClientProfileManager {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
