//! Engine configuration
//!
//! Resolution order:
//! 1. `--config <path>` on the command line
//! 2. `FYP_ENGINE_CONFIG` environment variable
//! 3. Built-in defaults
//!
//! Every section is optional in the TOML file; missing keys fall back to the
//! defaults below. The loaded configuration is validated before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::MarkComponent;

pub const CONFIG_ENV_VAR: &str = "FYP_ENGINE_CONFIG";

/// Slack for supervision weights written as decimals, e.g. 33.3 + 33.3 + 33.4
const SUPERVISION_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub results: ResultsPolicy,
    pub groups: GroupPolicy,
    pub panels: PanelPolicy,
}

/// Relative weight of each mark component in the total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentWeights {
    pub proposal: f64,
    pub mid_eval: f64,
    pub final_eval: f64,
    pub supervisor: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        ComponentWeights {
            proposal: 25.0,
            mid_eval: 25.0,
            final_eval: 25.0,
            supervisor: 25.0,
        }
    }
}

impl ComponentWeights {
    pub fn weight(&self, component: MarkComponent) -> f64 {
        match component {
            MarkComponent::Proposal => self.proposal,
            MarkComponent::MidEval => self.mid_eval,
            MarkComponent::FinalEval => self.final_eval,
            MarkComponent::Supervisor => self.supervisor,
        }
    }

    pub fn sum(&self) -> f64 {
        MarkComponent::ALL.iter().map(|c| self.weight(*c)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    /// Inclusive lower bound of the band
    pub min: f64,
    pub grade: String,
}

/// Four supervision criteria, each scored 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionWeights {
    pub regularity: f64,
    pub progress: f64,
    pub technical: f64,
    pub documentation: f64,
}

impl Default for SupervisionWeights {
    fn default() -> Self {
        SupervisionWeights {
            regularity: 20.0,
            progress: 25.0,
            technical: 35.0,
            documentation: 20.0,
        }
    }
}

impl SupervisionWeights {
    pub fn sum(&self) -> f64 {
        self.regularity + self.progress + self.technical + self.documentation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsPolicy {
    pub weights: ComponentWeights,
    /// Ordered from the highest threshold down; the last band must start at 0.
    pub bands: Vec<GradeBand>,
    pub supervision: SupervisionWeights,
}

impl Default for ResultsPolicy {
    fn default() -> Self {
        let bands = [
            (85.0, "A"),
            (80.0, "A-"),
            (75.0, "B+"),
            (71.0, "B"),
            (68.0, "B-"),
            (64.0, "C+"),
            (61.0, "C"),
            (58.0, "C-"),
            (54.0, "D+"),
            (50.0, "D"),
            (0.0, "F"),
        ]
        .into_iter()
        .map(|(min, grade)| GradeBand {
            min,
            grade: grade.to_string(),
        })
        .collect();

        ResultsPolicy {
            weights: ComponentWeights::default(),
            bands,
            supervision: SupervisionWeights::default(),
        }
    }
}

impl ResultsPolicy {
    pub fn validate(&self) -> Result<()> {
        for component in MarkComponent::ALL {
            let weight = self.weights.weight(*component);
            if !weight.is_finite() || weight < 0.0 {
                return Err(EngineError::Config(format!(
                    "weight for {component} must be a non-negative number"
                )));
            }
        }
        if self.weights.sum() <= 0.0 {
            return Err(EngineError::Config(
                "component weights must have a positive sum".to_string(),
            ));
        }

        if self.bands.is_empty() {
            return Err(EngineError::Config("grade bands must not be empty".to_string()));
        }
        if let Some(band) = self.bands.iter().find(|b| !(0.0..=100.0).contains(&b.min)) {
            return Err(EngineError::Config(format!(
                "grade band {} must start between 0 and 100",
                band.grade
            )));
        }
        for pair in self.bands.windows(2) {
            if pair[1].min >= pair[0].min {
                return Err(EngineError::Config(format!(
                    "grade bands must be strictly descending ({} then {})",
                    pair[0].grade, pair[1].grade
                )));
            }
        }
        if self.bands.last().map(|b| b.min) != Some(0.0) {
            return Err(EngineError::Config(
                "the lowest grade band must start at 0".to_string(),
            ));
        }

        let s = &self.supervision;
        let parts = [s.regularity, s.progress, s.technical, s.documentation];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::Config(
                "supervision weights must be non-negative numbers".to_string(),
            ));
        }
        if (s.sum() - 100.0).abs() > SUPERVISION_SUM_TOLERANCE {
            return Err(EngineError::Config(
                "supervision weights must sum to 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    pub min_members: usize,
    pub max_members: usize,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        GroupPolicy {
            min_members: 1,
            max_members: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelPolicy {
    /// Allocations below this size are accepted with a warning
    pub recommended_internal: usize,
}

impl Default for PanelPolicy {
    fn default() -> Self {
        PanelPolicy {
            recommended_internal: 2,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.results.validate()?;
        if self.groups.min_members == 0 || self.groups.min_members > self.groups.max_members {
            return Err(EngineError::Config(format!(
                "invalid group size range {}..={}",
                self.groups.min_members, self.groups.max_members
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from the CLI path, then the environment variable, then defaults.
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_path {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&PathBuf::from(path));
        }
        Ok(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [results.weights]
            proposal = 10.0
            mid_eval = 20.0
            final_eval = 40.0
            supervisor = 30.0
            "#,
        )
        .unwrap();
        assert_eq!(config.results.weights.final_eval, 40.0);
        assert_eq!(config.results.bands.len(), 11);
        assert_eq!(config.groups.max_members, 4);
    }

    #[test]
    fn non_descending_bands_are_rejected() {
        let mut policy = ResultsPolicy::default();
        policy.bands.swap(0, 1);
        assert!(matches!(policy.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn bands_must_reach_zero() {
        let mut policy = ResultsPolicy::default();
        policy.bands.pop();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn zero_weights_are_rejected() {
        let mut policy = ResultsPolicy::default();
        policy.weights = ComponentWeights {
            proposal: 0.0,
            mid_eval: 0.0,
            final_eval: 0.0,
            supervisor: 0.0,
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn supervision_weights_must_sum_to_hundred() {
        let mut policy = ResultsPolicy::default();
        policy.supervision.technical = 30.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn nan_band_threshold_is_rejected() {
        let mut policy = ResultsPolicy::default();
        policy.bands[1].min = f64::NAN;
        assert!(matches!(policy.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn decimal_supervision_weights_are_accepted() {
        let mut policy = ResultsPolicy::default();
        policy.supervision = SupervisionWeights {
            regularity: 33.3,
            progress: 33.3,
            technical: 30.3,
            documentation: 3.1,
        };
        policy.validate().unwrap();

        policy.supervision.documentation = f64::NAN;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[groups]\nmin_members = 2\nmax_members = 3").unwrap();
        let config = EngineConfig::resolve(Some(file.path())).unwrap();
        assert_eq!(config.groups.min_members, 2);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/fyp.toml")).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
