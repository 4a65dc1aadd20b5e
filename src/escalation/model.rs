// src/escalation/model.rs
// Pre-trained binary classifier. The artifact is a JSON file produced by
// the offline training pipeline: named feature weights plus a bias, applied
// through a logistic link. Loaded once at startup and read-only afterwards.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

use super::features::FeatureVector;

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierArtifact {
    pub version: u32,
    pub bias: f64,
    pub weights: std::collections::BTreeMap<String, f64>,
}

pub struct Classifier {
    artifact: ClassifierArtifact,
}

impl Classifier {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Artifact(format!(
                "classifier artifact missing at {}: {}",
                path.display(),
                e
            ))
        })?;
        let artifact: ClassifierArtifact = serde_json::from_str(&text).map_err(|e| {
            Error::Artifact(format!(
                "classifier artifact at {} is invalid: {}",
                path.display(),
                e
            ))
        })?;
        if artifact.version != SUPPORTED_VERSION {
            return Err(Error::Artifact(format!(
                "classifier artifact version {} unsupported (expected {})",
                artifact.version, SUPPORTED_VERSION
            )));
        }
        info!(
            path = %path.display(),
            features = artifact.weights.len(),
            "loaded classifier artifact"
        );
        Ok(Classifier { artifact })
    }

    pub fn from_artifact(artifact: ClassifierArtifact) -> Self {
        Classifier { artifact }
    }

    /// Positive-class probability for a feature vector. Features the
    /// artifact does not know contribute nothing; artifact weights with no
    /// matching feature are ignored the same way.
    pub fn predict(&self, features: &FeatureVector) -> f64 {
        let mut z = self.artifact.bias;
        for (name, value) in features.pairs() {
            if let Some(weight) = self.artifact.weights.get(*name) {
                z += weight * value;
            }
        }
        sigmoid(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
