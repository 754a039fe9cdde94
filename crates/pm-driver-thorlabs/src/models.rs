//! Supported console models.
//!
//! A device is recognised as a supported console when its `*IDN?` answer
//! contains one of the identity substrings below. The table is scanned in
//! order and the first match wins.

use pm_core::PmError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Console models this driver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    /// PM100D handheld console
    #[serde(rename = "PM100D")]
    Pm100D,
    /// PM100A analog console
    #[serde(rename = "PM100A")]
    Pm100A,
}

/// Pairs a model with the substring that identifies it in `*IDN?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelIdentifier {
    /// Model this row identifies
    pub model: Model,
    /// Substring of the identity answer
    pub identity: &'static str,
}

/// The model table, in match priority order.
pub const MODEL_IDENTIFIERS: &[ModelIdentifier] = &[
    ModelIdentifier {
        model: Model::Pm100D,
        identity: "Thorlabs,PM100D",
    },
    ModelIdentifier {
        model: Model::Pm100A,
        identity: "Thorlabs,PM100A",
    },
];

impl Model {
    /// Name as used in the model table and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Model::Pm100D => "PM100D",
            Model::Pm100A => "PM100A",
        }
    }

    /// All supported model names, comma separated.
    pub fn supported_names() -> String {
        MODEL_IDENTIFIERS
            .iter()
            .map(|row| row.model.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// First model whose identity substring appears in `identity`.
    pub fn match_identity(identity: &str) -> Option<Model> {
        MODEL_IDENTIFIERS
            .iter()
            .find(|row| identity.contains(row.identity))
            .map(|row| row.model)
    }

    /// First model whose name appears in `identity`.
    ///
    /// Used after connecting, where only the model tag is needed.
    pub fn tag_from_identity(identity: &str) -> Option<Model> {
        MODEL_IDENTIFIERS
            .iter()
            .find(|row| identity.contains(row.model.name()))
            .map(|row| row.model)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Model {
    type Err = PmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MODEL_IDENTIFIERS
            .iter()
            .map(|row| row.model)
            .find(|model| model.name() == s)
            .ok_or_else(|| PmError::UnsupportedModel {
                requested: s.to_string(),
                supported: Model::supported_names(),
            })
    }
}
