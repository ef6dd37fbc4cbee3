//! Process-wide configuration. Unlike the core library, the binary is
//! allowed a single global: every other entry point in `arbiter-judge` takes
//! its configuration explicitly (spec §9 "Global state: none required").

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use arbiter_judge::sandbox::SandboxCfg;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
/// arbiter server config.
pub struct Cfg {
    /// Address for the service's TCP front door to listen on.
    pub addr: String,

    /// Number of judge workers (and sandbox ids) to start.
    pub workers: u32,

    /// Default locale for verdict text the web surface renders; the core
    /// itself is locale-agnostic.
    pub locale_default: String,

    /// Path to the encrypted contest archive.
    pub contests: String,

    /// Skips password authentication and reads the key/password from
    /// `./pass` instead (spec §6 "a testing flag that skips authentication").
    pub testing: bool,

    pub sandbox: SandboxCfg,
}

impl Default for Cfg {
    fn default() -> Self {
        Cfg {
            addr: ":8080".to_string(),
            workers: 2,
            locale_default: "en".to_string(),
            contests: "db.zip".to_string(),
            testing: false,
            sandbox: SandboxCfg::default(),
        }
    }
}

lazy_static::lazy_static! {
    /// Global config, populated once by `load_config` at the top of `main`.
    pub static ref CONFIG: RwLock<Cfg> = RwLock::new(Cfg::default());
}

/// Loads the global config from (in increasing priority order) `/etc/arbiter/arbiter`,
/// each of `search_paths`, then `ARBITER_`-prefixed environment variables.
pub fn load_config(search_paths: &[String]) {
    let mut builder =
        config::Config::builder().add_source(config::File::with_name("/etc/arbiter/arbiter").required(false));

    for p in search_paths {
        builder = builder.add_source(config::File::with_name(p).required(false));
    }

    builder = builder.add_source(config::Environment::with_prefix("ARBITER"));

    *CONFIG.write().expect("config lock poisoned") = builder
        .build()
        .expect("invalid configuration")
        .try_deserialize::<Cfg>()
        .expect("configuration did not match Cfg");
}
