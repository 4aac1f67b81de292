//! Session state and configuration: which operations are legal when, and how a dataset is opened.
//!
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    cache::CachePolicy,
    errors::{Error, Result},
};

/// The two states of an open dataset.
///
/// Schema mutation is only legal in define mode, data transfer only in data mode.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Define,
    Data,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Define => f.write_str("define"),
            Mode::Data => f.write_str("data"),
        }
    }
}

/// Whether newly defined variables are prefilled with their fill value
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    #[default]
    Fill,
    NoFill,
}

/// The data model a dataset was created with
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// Groups, any number of unlimited dimensions, unsigned and 64 bit types, strings
    Extended,

    /// Restricted to what the classic data model can express
    ClassicModel,
}

/// Options for creating and opening datasets.
///
/// Every field has a default, so a partial configuration can be deserialized:
///
/// ```
/// let config: hcdf::Config = serde_json::from_str(r#"{"share": true}"#).unwrap();
/// assert!(config.share && config.write);
/// ```
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Open for writing. Ignored by `create`, which always yields a writable dataset.
    pub write: bool,

    /// On `create`, overwrite an existing dataset instead of failing with `Error::Exists`
    pub clobber: bool,

    /// On `create`, restrict the dataset to the classic data model
    pub classic_model: bool,

    /// Disable write-back chunk caching, so every write reaches the block store immediately
    pub share: bool,

    /// Fill mode for variables defined through this handle
    pub fill: FillMode,

    /// Default chunk cache limits for every variable
    pub cache: CachePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write: true,
            clobber: true,
            classic_model: false,
            share: false,
            fill: FillMode::Fill,
            cache: CachePolicy::default(),
        }
    }
}

impl Config {
    /// A configuration for read only access
    pub fn read_only() -> Self {
        Self {
            write: false,
            ..Self::default()
        }
    }
}

/// Tracks the mode of an open dataset and guards operations against it
///
#[derive(Clone, Copy, Debug)]
pub(crate) struct Session {
    pub mode: Mode,
    pub writable: bool,
    pub fill: FillMode,
}

impl Session {
    pub fn new(mode: Mode, writable: bool, fill: FillMode) -> Self {
        Self {
            mode,
            writable,
            fill,
        }
    }

    pub fn require(&self, expected: Mode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(Error::WrongMode {
                expected,
                actual: self.mode,
            })
        }
    }

    pub fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::PermissionDenied(String::from(
                "dataset is open read only",
            )))
        }
    }

    /// Schema changes need define mode, which only a writable handle can reach
    pub fn require_define(&self) -> Result<()> {
        self.require(Mode::Define)
    }

    /// Data writes need data mode on a writable handle
    pub fn require_data_write(&self) -> Result<()> {
        self.require(Mode::Data)?;
        self.require_writable()
    }
}
