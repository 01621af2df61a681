//! Options that influence where a bootloader keeps its state.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

/// The boot stage the environment is being set up for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// No particular role; the bootloader uses its defaults.
    #[default]
    None,
    /// The minimal recovery system.
    Recovery,
    /// The normal, installed system.
    RunMode,
}

/// Options passed when constructing a bootloader.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Options {
    /// The boot stage.
    #[serde(default)]
    pub role: Role,
    /// The bootloader partition is accessed directly instead of being
    /// mounted at `/boot`.
    #[serde(default)]
    pub no_slash_boot: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    bootloader: Option<Options>,
}

impl Options {
    /// Parse the `[bootloader]` table of a TOML document; a missing
    /// table yields the defaults.
    pub fn from_toml(s: &str) -> Result<Self> {
        let f: OptionsFile = toml::from_str(s)?;
        Ok(f.bootloader.unwrap_or_default())
    }

    /// Load options from a TOML file.
    #[context("Loading options from {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path).context("Reading")?;
        Self::from_toml(&buf)
    }
}
