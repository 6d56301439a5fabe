//! Marker dictionaries loaded at runtime.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum DictionaryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid dictionary `{name}`: {reason}")]
    Invalid { name: String, reason: String },
}

/// An ArUco-style dictionary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionary {
    /// Human-readable name (for logging).
    pub name: String,
    /// Number of inner bits per marker side.
    pub marker_size: usize,
    /// Largest Hamming distance the dictionary can correct.
    #[serde(default)]
    pub max_correction_bits: u8,
    /// One code per marker id: the inner `marker_size × marker_size` bits in
    /// row-major order with **black = 1**.
    pub codes: Vec<u64>,
}

impl Dictionary {
    /// Build and validate a dictionary.
    pub fn new(
        name: impl Into<String>,
        marker_size: usize,
        max_correction_bits: u8,
        codes: Vec<u64>,
    ) -> Result<Self, DictionaryError> {
        let dict = Self {
            name: name.into(),
            marker_size,
            max_correction_bits,
            codes,
        };
        dict.validate()?;
        Ok(dict)
    }

    /// Total number of inner bits per marker.
    #[inline]
    pub fn bit_count(&self) -> usize {
        self.marker_size * self.marker_size
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn validate(&self) -> Result<(), DictionaryError> {
        let invalid = |reason: String| DictionaryError::Invalid {
            name: self.name.clone(),
            reason,
        };
        if self.marker_size == 0 || self.bit_count() > 64 {
            return Err(invalid(format!(
                "marker_size {} must be in 1..=8",
                self.marker_size
            )));
        }
        if self.codes.is_empty() {
            return Err(invalid("no codes".to_string()));
        }
        let bits = self.bit_count();
        if bits < 64 {
            if let Some((id, code)) = self
                .codes
                .iter()
                .enumerate()
                .find(|(_, c)| **c >> bits != 0)
            {
                return Err(invalid(format!(
                    "code {code:#x} of marker {id} exceeds {bits} bits"
                )));
            }
        }
        Ok(())
    }

    /// Load a dictionary from JSON on disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let raw = fs::read_to_string(path)?;
        let dict: Self = serde_json::from_str(&raw)?;
        dict.validate()?;
        Ok(dict)
    }

    /// Write the dictionary as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), DictionaryError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
