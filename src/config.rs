//! `[AMBIENT]` Configuration surface for the responder core: hostname,
//! bind address, default TTL overrides, and the rename budget. Grounded on
//! the teacher's `ConfigFile` (the `config` crate layered over environment
//! variables), trimmed of every web/db/oauth field this responder has no
//! use for.

use std::net::Ipv4Addr;

use config::Config;
use serde::{Deserialize, Serialize};

use crate::service::default_hostname;
use crate::state_machine::StateMachineConfig;

/// Options controlling a [`crate::Responder`]. Constructible
/// programmatically via [`ResponderOptions::default`] plus field
/// overrides, or loaded from a TOML/JSON file layered with `MDNS_`-prefixed
/// environment variables via [`ResponderOptions::load`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponderOptions {
    /// Overrides the `gethostname()`-derived default (§3.1).
    pub hostname: Option<String>,
    /// Interface to bind the multicast socket to; `0.0.0.0` listens on
    /// every interface.
    pub bind_addr: Ipv4Addr,
    /// Overrides the A record TTL (default 4500s, §3.2).
    pub ttl_a: Option<u32>,
    /// Overrides the PTR/SRV/TXT TTL (default 120s, §3.2).
    pub ttl_service: Option<u32>,
    /// Maximum instance-name rename attempts before `ConflictExhausted`
    /// (default 10, §4.4).
    pub max_rename_attempts: u8,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        ResponderOptions {
            hostname: None,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            ttl_a: None,
            ttl_service: None,
            max_rename_attempts: 10,
        }
    }
}

impl ResponderOptions {
    /// Resolves the effective hostname: the configured override, or the
    /// system hostname suffixed `.local`.
    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(default_hostname)
    }

    pub fn state_machine_config(&self) -> StateMachineConfig {
        StateMachineConfig {
            max_rename_attempts: self.max_rename_attempts,
            ttl_a: self.ttl_a,
            ttl_service: self.ttl_service,
            deterministic_jitter: false,
        }
    }

    /// Loads options from `path` (TOML or JSON, inferred from the
    /// extension) layered under `MDNS_`-prefixed environment variables,
    /// mirroring the teacher's `Config::builder().add_source(File::...)`
    /// pattern in `ConfigFile::try_from`.
    pub fn load(path: &str) -> Result<ResponderOptions, config::ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MDNS"));
        builder.build()?.try_deserialize()
    }
}
