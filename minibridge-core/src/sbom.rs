//! Tool and prompt manifests.
//!
//! A manifest (SBOM) records a SHA-256 of every tool and prompt description,
//! and of every parameter description, as produced by a trusted scan. At run
//! time the same hashes are recomputed from `tools/list` and `prompts/list`
//! results and compared against it, which detects servers whose advertised
//! tools were altered after the scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::mcp::{Prompt, Tool};

/// Errors raised while loading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum SbomError {
    #[error("unable to load sbom file at '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to decode content of sbom file: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Why observed hashes do not match a manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Mismatch {
    #[error("invalid len. left: {left} right: {right}")]
    Length { left: usize, right: usize },

    #[error("'{name}': missing")]
    Missing { name: String },

    #[error("'{name}': hash mismatch")]
    Hash { name: String },

    #[error("'{name}': invalid param: {inner}")]
    Param { name: String, inner: Box<Mismatch> },
}

/// Hash of one named item and, one level down, of its parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash {
    pub name: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Hashes::is_empty")]
    pub params: Hashes,
}

/// A list of [`Hash`] sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hashes(pub Vec<Hash>);

impl Hashes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn by_name(&self) -> HashMap<&str, &Hash> {
        self.0.iter().map(|h| (h.name.as_str(), h)).collect()
    }

    /// Checks `observed` against this manifest.
    ///
    /// Every observed entry must exist in the manifest with the same hash,
    /// and the manifest may not be smaller than the observed set. When the
    /// manifest lists parameters for an entry, the observed parameters are
    /// checked the same way.
    pub fn matches(&self, observed: &Hashes) -> Result<(), Mismatch> {
        if observed.len() > self.len() {
            return Err(Mismatch::Length {
                left: self.len(),
                right: observed.len(),
            });
        }

        let manifest = self.by_name();
        for h in &observed.0 {
            let Some(reference) = manifest.get(h.name.as_str()) else {
                return Err(Mismatch::Missing {
                    name: h.name.clone(),
                });
            };

            if h.hash != reference.hash {
                return Err(Mismatch::Hash {
                    name: h.name.clone(),
                });
            }

            if !reference.params.is_empty() {
                reference
                    .params
                    .matches(&h.params)
                    .map_err(|inner| Mismatch::Param {
                        name: h.name.clone(),
                        inner: Box::new(inner),
                    })?;
            }
        }

        Ok(())
    }
}

/// Manifest of tool and prompt hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sbom {
    #[serde(default, skip_serializing_if = "Hashes::is_empty")]
    pub tools: Hashes,

    #[serde(default, skip_serializing_if = "Hashes::is_empty")]
    pub prompts: Hashes,
}

impl Sbom {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SbomError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| SbomError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.prompts.is_empty()
    }
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn sorted(mut hashes: Vec<Hash>) -> Hashes {
    hashes.sort_by(|a, b| a.name.cmp(&b.name));
    Hashes(hashes)
}

/// Hashes tool descriptions and their `inputSchema` property descriptions.
pub fn hash_tools(tools: &[Tool]) -> Hashes {
    sorted(
        tools
            .iter()
            .map(|tool| Hash {
                name: tool.name.clone(),
                hash: sha256_hex(&tool.description),
                params: sorted(
                    tool.parameter_descriptions()
                        .map(|(name, desc)| Hash {
                            name: name.to_string(),
                            hash: sha256_hex(desc),
                            params: Hashes::default(),
                        })
                        .collect(),
                ),
            })
            .collect(),
    )
}

/// Hashes prompt descriptions and their argument descriptions.
pub fn hash_prompts(prompts: &[Prompt]) -> Hashes {
    sorted(
        prompts
            .iter()
            .map(|prompt| Hash {
                name: prompt.name.clone(),
                hash: sha256_hex(&prompt.description),
                params: sorted(
                    prompt
                        .arguments
                        .iter()
                        .map(|arg| Hash {
                            name: arg.name.clone(),
                            hash: sha256_hex(&arg.description),
                            params: Hashes::default(),
                        })
                        .collect(),
                ),
            })
            .collect(),
    )
}
