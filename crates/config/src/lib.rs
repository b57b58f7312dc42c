//! Configuration for switchboard: schema types plus file discovery.
//!
//! Files are TOML, YAML or JSON; `${VAR}` / `${VAR:-default}` placeholders are
//! expanded before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_config_file, load_config,
        set_config_dir, to_toml_string,
    },
    schema::{FetchConfig, RateLimitSection, ServerConfig, SwitchboardConfig, UpstreamConfig},
};
