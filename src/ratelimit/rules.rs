//! Named rate limit policies loaded from configuration.
//!
//! A policy is a reusable strategy list, optionally with a retention horizon
//! override. Hosts bind a policy to the concrete keys of a request to get a
//! [`Limiter`]:
//!
//! ```yaml
//! policies:
//!   login:
//!     strategies:
//!       - window_secs: 60
//!         limit: 5
//!       - window_secs: 3600
//!         limit: 20
//!   search:
//!     strategies:
//!       - window_secs: 1
//!         limit: 10
//!     expiration_secs: 120
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::limiter::{Limiter, LimiterBuilder};
use super::strategy::Strategy;
use crate::error::{Result, SlidegateError};

/// A set of named policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Map of policy name to policy
    #[serde(default)]
    pub policies: HashMap<String, Policy>,
}

/// A reusable list of strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Strategies in evaluation order
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    /// Retention horizon override in seconds
    #[serde(default)]
    pub expiration_secs: Option<u64>,
}

impl Policy {
    /// Bind this policy to `keys`.
    pub fn limiter_for<I, K>(&self, keys: I) -> Result<Limiter>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let builder = LimiterBuilder::new()
            .keys(keys)
            .strategies(self.strategies.iter().copied());
        match self.expiration_secs {
            Some(secs) => builder.expiration(secs).build(),
            None => builder.build(),
        }
    }
}

impl PolicySet {
    /// Create an empty policy set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse rate limit policies: {}", e)))
    }

    /// Get a policy by name.
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// Build a limiter from the named policy for `keys`.
    pub fn limiter_for<I, K>(&self, name: &str, keys: I) -> Result<Limiter>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.get(name)
            .ok_or_else(|| SlidegateError::Config(format!("unknown policy: {}", name)))?
            .limiter_for(keys)
    }

    /// Check every policy can produce a limiter.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.policies {
            policy.limiter_for([name.as_str()]).map_err(|e| {
                SlidegateError::Config(format!("invalid policy {}: {}", name, e))
            })?;
        }
        Ok(())
    }
}
