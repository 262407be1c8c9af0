//! QC configuration: loading and validation.
//!
//! The file is YAML (or JSON when the extension is `.json`):
//!
//! ```yaml
//! qartod:
//!   - test_name: gross_range
//!     variable: temperature
//!     parameters: { min: -2.0, max: 40.0, suspect_min: 0.0, suspect_max: 35.0 }
//!   - test_name: spike
//!     variable: temperature
//!     parameters: { suspect_threshold: 1.0, fail_threshold: 3.0 }
//! hysteresis:
//!   variables:
//!     temperature: { suspect_threshold: 0.5, fail_threshold: 1.5 }
//! ```
//!
//! Everything is validated into a [`QcPlan`] before any dataset is touched.

use std::path::{Path, PathBuf};

use gliderqc_core::{
    ConfiguredTest, ExpectedTests, FlagSummarizer, HysteresisConfig, HysteresisTest, QartodTest,
    QartodTestRunner, QcError, HYSTERESIS_TEST_NAME,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

/// One configured QARTOD test as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTestConfig {
    #[serde(alias = "test")]
    pub test_name: String,
    pub variable: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// The config file before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawQcConfig {
    #[serde(default)]
    pub qartod: Vec<RawTestConfig>,
    #[serde(default)]
    pub hysteresis: Option<HysteresisConfig>,
}

impl RawQcConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, String> {
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn from_json_str(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }

    /// Read a config file; `.json` files are JSON, everything else YAML.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        };
        parsed.map_err(|reason| PipelineError::ConfigParse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// SHA-256 of the canonical JSON form.
    pub fn digest(&self) -> Result<String, QcError> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Validate every test and build the plan the pipeline executes.
    pub fn validate(&self) -> Result<QcPlan, QcError> {
        let mut expected = ExpectedTests::new();
        let mut tests = Vec::with_capacity(self.qartod.len());
        for (position, raw) in self.qartod.iter().enumerate() {
            if raw.variable.trim().is_empty() {
                return Err(QcError::Configuration(format!(
                    "qartod entry {position} ({}) has no variable",
                    raw.test_name
                )));
            }
            let test = QartodTest::from_parameters(&raw.test_name, &raw.parameters)?;
            expected.expect(&raw.variable, test.name());
            tests.push(ConfiguredTest::new(&raw.variable, test));
        }
        let runner = QartodTestRunner::new(tests)?;
        let hysteresis = self.hysteresis.clone().map(HysteresisTest::new).transpose()?;
        Ok(QcPlan::assemble(runner, hysteresis, expected, self.digest()?))
    }
}

/// Validated configuration shared by every worker of a batch.
#[derive(Debug, Clone)]
pub struct QcPlan {
    runner: QartodTestRunner,
    hysteresis: Option<HysteresisTest>,
    summarizer: FlagSummarizer,
    expected: ExpectedTests,
    digest: String,
    source: Option<PathBuf>,
}

impl QcPlan {
    /// A plan from already constructed stages, digested over their
    /// serialized parameters.
    pub fn from_parts(
        runner: QartodTestRunner,
        hysteresis: Option<HysteresisTest>,
    ) -> Result<Self, QcError> {
        let bytes = serde_json::to_vec(&(runner.tests(), hysteresis.as_ref().map(HysteresisTest::config)))?;
        let digest = hex::encode(Sha256::digest(bytes));
        let mut expected = ExpectedTests::new();
        for configured in runner.tests() {
            expected.expect(&configured.variable, configured.name());
        }
        Ok(Self::assemble(runner, hysteresis, expected, digest))
    }

    fn assemble(
        runner: QartodTestRunner,
        hysteresis: Option<HysteresisTest>,
        mut expected: ExpectedTests,
        digest: String,
    ) -> Self {
        if let Some(test) = &hysteresis {
            for variable in test.variables() {
                expected.expect(variable, HYSTERESIS_TEST_NAME);
            }
        }
        if runner.is_empty() && hysteresis.is_none() {
            warn!("QC configuration enables no tests");
        }
        Self {
            runner,
            hysteresis,
            summarizer: FlagSummarizer::new(expected.clone()),
            expected,
            digest,
            source: None,
        }
    }

    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let mut plan = RawQcConfig::load(path)?.validate()?;
        plan.source = Some(path.to_path_buf());
        info!(
            config = %path.display(),
            digest = %plan.digest,
            qartod_tests = plan.runner.tests().len(),
            hysteresis = plan.hysteresis.is_some(),
            "QC configuration loaded"
        );
        Ok(plan)
    }

    pub fn runner(&self) -> &QartodTestRunner {
        &self.runner
    }

    pub fn hysteresis(&self) -> Option<&HysteresisTest> {
        self.hysteresis.as_ref()
    }

    pub fn summarizer(&self) -> &FlagSummarizer {
        &self.summarizer
    }

    pub fn expected(&self) -> &ExpectedTests {
        &self.expected
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
qartod:
  - test_name: gross_range
    variable: temperature
    parameters: { min: -2.0, max: 40.0, suspect_min: 0.0, suspect_max: 35.0 }
  - test: spike
    variable: temperature
    parameters:
      suspect_threshold: 1.0
      fail_threshold: 3.0
hysteresis:
  max_pressure_gap: 2.0
  variables:
    temperature: { suspect_threshold: 0.5, fail_threshold: 1.5 }
    conductivity: { suspect_threshold: 0.01, fail_threshold: 0.05 }
"#;

    #[test]
    fn test_yaml_config_validates() {
        let plan = RawQcConfig::from_yaml_str(SAMPLE).unwrap().validate().unwrap();
        assert_eq!(plan.runner().tests().len(), 2);
        assert!(plan.hysteresis().is_some());

        let temperature: Vec<_> = plan
            .expected()
            .tests_for("temperature")
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(temperature, vec!["gross_range", "hysteresis", "spike"]);
        assert!(plan.expected().tests_for("conductivity").is_some());
        assert_eq!(plan.digest().len(), 64);
    }

    #[test]
    fn test_unknown_test_fails_fast() {
        let raw = RawQcConfig::from_yaml_str(
            "qartod:\n  - test_name: attenuated_signal\n    variable: temperature\n",
        )
        .unwrap();
        let err = raw.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("attenuated_signal"));
    }

    #[test]
    fn test_missing_variable_rejected() {
        let raw = RawQcConfig::from_yaml_str(
            "qartod:\n  - test_name: gross_range\n    variable: ''\n    parameters: { min: 0, max: 1 }\n",
        )
        .unwrap();
        assert!(matches!(raw.validate(), Err(QcError::Configuration(_))));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        assert!(RawQcConfig::from_yaml_str("qartodd: []\n").is_err());
    }

    #[test]
    fn test_json_and_yaml_agree() {
        let yaml = RawQcConfig::from_yaml_str(SAMPLE).unwrap();
        let json = RawQcConfig::from_json_str(&serde_json::to_string(&yaml).unwrap()).unwrap();
        assert_eq!(yaml.digest().unwrap(), json.digest().unwrap());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qc.yml");
        std::fs::write(&path, SAMPLE).unwrap();
        let plan = QcPlan::load(&path).unwrap();
        assert_eq!(plan.source(), Some(path.as_path()));

        let missing = QcPlan::load(&dir.path().join("absent.yml")).unwrap_err();
        assert!(matches!(missing, PipelineError::ConfigRead { .. }));
        assert!(missing.is_fatal());
    }

    #[test]
    fn test_plan_from_parts() {
        let loaded = RawQcConfig::from_yaml_str(SAMPLE).unwrap().validate().unwrap();
        let plan = QcPlan::from_parts(loaded.runner().clone(), loaded.hysteresis().cloned()).unwrap();

        assert_eq!(plan.expected(), loaded.expected());
        assert_eq!(plan.digest().len(), 64);
        assert!(plan.source().is_none());
    }

    #[test]
    fn test_empty_config_is_allowed() {
        let plan = RawQcConfig::default().validate().unwrap();
        assert!(plan.runner().is_empty());
        assert!(plan.expected().is_empty());
    }
}
