//! Normalization tables for unit type, output type and datatype strings.
//!
//! The builtin table is compiled in from `vocabulary/default.json`. Users can
//! layer their own synonyms from a JSON file of the same shape. A
//! [`Vocabulary`] is built once before parsing and only read afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::XdfError;
use crate::parser::schema::{Coded, DataType, OutputType, UnitType};

const EMBEDDED_DEFAULT: &str = include_str!("../../vocabulary/default.json");

/// On-disk shape: canonical value → synonyms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VocabularyFile {
    #[serde(default)]
    pub datatypes: BTreeMap<DataType, Vec<String>>,
    #[serde(default)]
    pub unit_types: BTreeMap<UnitType, Vec<String>>,
    #[serde(default)]
    pub output_types: BTreeMap<OutputType, Vec<String>>,
}

/// One row of the normalization table, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VocabularyEntry {
    pub category: &'static str,
    pub synonym: String,
    pub canonical: String,
}

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    datatypes: HashMap<String, DataType>,
    unit_types: HashMap<String, UnitType>,
    output_types: HashMap<String, OutputType>,
}

fn key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn canonical_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl Vocabulary {
    /// The compiled-in table. Falls back to an empty table (everything
    /// unverified) if the embedded JSON is unreadable.
    pub fn builtin() -> Self {
        match Self::from_json_str(EMBEDDED_DEFAULT) {
            Ok(vocabulary) => vocabulary,
            Err(e) => {
                tracing::warn!("Failed to parse embedded vocabulary: {}", e);
                Self::default()
            }
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, XdfError> {
        let file: VocabularyFile =
            serde_json::from_str(json).map_err(|e| XdfError::Vocabulary(e.to_string()))?;
        Ok(Self::default().extended_with(file))
    }

    /// Builtin table with the synonyms from `path` layered on top.
    pub fn with_extension_file(path: &Path) -> Result<Self, XdfError> {
        let content = std::fs::read_to_string(path)?;
        let file: VocabularyFile = serde_json::from_str(&content)
            .map_err(|e| XdfError::Vocabulary(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded vocabulary extension from {}", path.display());
        Ok(Self::builtin().extended_with(file))
    }

    /// Add synonyms; later definitions of the same synonym win.
    pub fn extended_with(mut self, file: VocabularyFile) -> Self {
        for (value, synonyms) in file.datatypes {
            for s in synonyms {
                self.datatypes.insert(key(&s), value);
            }
        }
        for (value, synonyms) in file.unit_types {
            for s in synonyms {
                self.unit_types.insert(key(&s), value);
            }
        }
        for (value, synonyms) in file.output_types {
            for s in synonyms {
                self.output_types.insert(key(&s), value);
            }
        }
        self
    }

    pub fn datatype(&self, raw: &str) -> Coded<DataType> {
        match self.datatypes.get(&key(raw)) {
            Some(&value) => Coded::known(raw.trim(), value),
            None => Coded::unverified(raw.trim()),
        }
    }

    pub fn unit_type(&self, raw: &str) -> Coded<UnitType> {
        match self.unit_types.get(&key(raw)) {
            Some(&value) => Coded::known(raw.trim(), value),
            None => Coded::unverified(raw.trim()),
        }
    }

    pub fn output_type(&self, raw: &str) -> Coded<OutputType> {
        match self.output_types.get(&key(raw)) {
            Some(&value) => Coded::known(raw.trim(), value),
            None => Coded::unverified(raw.trim()),
        }
    }

    /// Every synonym, sorted by category then synonym.
    pub fn entries(&self) -> Vec<VocabularyEntry> {
        let mut entries = Vec::new();
        for (synonym, value) in &self.datatypes {
            entries.push(VocabularyEntry {
                category: "datatype",
                synonym: synonym.clone(),
                canonical: canonical_name(value),
            });
        }
        for (synonym, value) in &self.unit_types {
            entries.push(VocabularyEntry {
                category: "unit_type",
                synonym: synonym.clone(),
                canonical: canonical_name(value),
            });
        }
        for (synonym, value) in &self.output_types {
            entries.push(VocabularyEntry {
                category: "output_type",
                synonym: synonym.clone(),
                canonical: canonical_name(value),
            });
        }
        entries.sort_by(|a, b| (a.category, &a.synonym).cmp(&(b.category, &b.synonym)));
        entries
    }
}
