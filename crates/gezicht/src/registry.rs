//! Face registry: names mapped to the encodings learned for them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Opaque face encoding. Never interpreted, only stored and forwarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding(Vec<f64>);

impl Encoding {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for Encoding {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Name → encodings, in the order they were learned.
///
/// Registration is additive: the same name may be registered any number of
/// times and every batch is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceRegistry {
    faces: BTreeMap<String, Vec<Encoding>>,
}

impl FaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, encodings: impl IntoIterator<Item = Encoding>) {
        self.faces
            .entry(name.to_string())
            .or_default()
            .extend(encodings);
    }

    pub fn get(&self, name: &str) -> Option<&[Encoding]> {
        self.faces.get(name).map(Vec::as_slice)
    }

    /// Entries that carry at least one encoding.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Encoding])> {
        self.faces
            .iter()
            .filter(|(_, encodings)| !encodings.is_empty())
            .map(|(name, encodings)| (name.as_str(), encodings.as_slice()))
    }

    pub fn face_count(&self) -> usize {
        self.iter().count()
    }

    pub fn encoding_count(&self) -> usize {
        self.faces.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.encoding_count() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingLoadError {
    #[error("failed to read encoding file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse encoding file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where precomputed encodings come from.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingSource {
    Inline(Vec<Encoding>),
    /// JSON file holding one vector or an array of vectors.
    File(PathBuf),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EncodingBatch {
    Many(Vec<Encoding>),
    One(Encoding),
}

impl EncodingSource {
    pub async fn load(self) -> Result<Vec<Encoding>, EncodingLoadError> {
        match self {
            EncodingSource::Inline(encodings) => Ok(encodings),
            EncodingSource::File(path) => {
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(source) => return Err(EncodingLoadError::Read { path, source }),
                };
                match serde_json::from_slice::<EncodingBatch>(&bytes) {
                    Ok(EncodingBatch::Many(encodings)) => Ok(encodings),
                    Ok(EncodingBatch::One(encoding)) => Ok(vec![encoding]),
                    Err(source) => Err(EncodingLoadError::Parse { path, source }),
                }
            }
        }
    }
}

impl From<Vec<Encoding>> for EncodingSource {
    fn from(encodings: Vec<Encoding>) -> Self {
        EncodingSource::Inline(encodings)
    }
}

impl From<Encoding> for EncodingSource {
    fn from(encoding: Encoding) -> Self {
        EncodingSource::Inline(vec![encoding])
    }
}

impl From<PathBuf> for EncodingSource {
    fn from(path: PathBuf) -> Self {
        EncodingSource::File(path)
    }
}

impl From<&Path> for EncodingSource {
    fn from(path: &Path) -> Self {
        EncodingSource::File(path.to_path_buf())
    }
}
