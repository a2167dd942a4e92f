//! Configuration for the branch messaging service.
//!
//! A single `recibo.{toml,yaml,yml,json}` file is discovered at startup,
//! `${VAR}` placeholders are expanded from the environment, and every field
//! falls back to a sensible default.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir,
    },
    schema::{ReciboConfig, SendRouting, WhatsAppConfig},
};
