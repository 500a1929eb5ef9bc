use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Connection settings for the persistence API, read from the environment.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("COPO_API_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token = std::env::var("COPO_API_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let timeout_secs = std::env::var("COPO_API_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(60);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn require_token(&self) -> anyhow::Result<&str> {
        self.token
            .as_deref()
            .context("COPO_API_TOKEN must be set; run `login` to obtain a token")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelThresholds {
    pub level2: f64,
    pub level3: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            level2: 60.0,
            level3: 70.0,
        }
    }
}

/// How the indirect (survey) term enters the final blend when a CO has no
/// survey value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndirectPolicy {
    /// Missing indirect attainment counts as 0 under weight `v`.
    #[default]
    Zero,
    /// Missing indirect attainment drops the `v` term; overall equals direct.
    Exclude,
}

/// Process-wide weighting coefficients for the attainment computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttainmentParameters {
    /// Weight of the external (SEE) level in direct attainment.
    pub x: f64,
    /// Weight of internal (CIA) attainment in direct attainment.
    pub y: f64,
    /// Weight of direct attainment in the final blend.
    pub u: f64,
    /// Weight of indirect attainment in the final blend.
    pub v: f64,
    pub level_thresholds: LevelThresholds,
    pub student_score_target: f64,
    pub default_co_target: f64,
    pub default_po_target: f64,
    pub indirect_policy: IndirectPolicy,
}

impl Default for AttainmentParameters {
    fn default() -> Self {
        Self {
            x: 0.2,
            y: 0.8,
            u: 0.9,
            v: 0.1,
            level_thresholds: LevelThresholds::default(),
            student_score_target: 66.0,
            default_co_target: 70.0,
            default_po_target: 70.0,
            indirect_policy: IndirectPolicy::Zero,
        }
    }
}

impl AttainmentParameters {
    /// Loads parameters from a JSON file; fields absent from the file keep
    /// their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parameters from {}", path.display()))?;
        let params: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid parameters file {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, weight) in [("x", self.x), ("y", self.y), ("u", self.u), ("v", self.v)] {
            if !(0.0..=1.0).contains(&weight) {
                bail!("weight {name} must be within [0, 1], got {weight}");
            }
        }
        let LevelThresholds { level2, level3 } = self.level_thresholds;
        if !(0.0..=100.0).contains(&level2) || !(0.0..=100.0).contains(&level3) {
            bail!("level thresholds must be percentages, got {level2}/{level3}");
        }
        if level2 > level3 {
            bail!("level2 threshold ({level2}) must not exceed level3 ({level3})");
        }
        Ok(())
    }
}
