//! Deployment directory layout under the glider data root.
//!
//! ```text
//! <root>/qc/config/qc.yml                                   default QC config
//! <root>/deployments/<year>/<glider>-<YYYYmmddTHHMM>/
//!     config/qc/qc.yml                deployment QC config (overrides the default)
//!     data/out/nc/<level>-profile/<mode>/
//!         queue/                      datasets awaiting or under QC
//!         <dataset>.json              qc-complete datasets, relocated out of the queue
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime};

use crate::error::{StorageError, StorageResult};

const CONFIG_FILE: &str = "qc.yml";
const CDM_DATA_TYPE: &str = "profile";

/// Whether a deployment's datasets are real-time or recovered data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DataMode {
    #[default]
    Rt,
    Delayed,
}

impl DataMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DataMode::Rt => "rt",
            DataMode::Delayed => "delayed",
        }
    }
}

/// Processing level of the datasets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DataLevel {
    #[default]
    Sci,
    Ngdac,
}

impl DataLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DataLevel::Sci => "sci",
            DataLevel::Ngdac => "ngdac",
        }
    }
}

impl FromStr for DataMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rt" => Ok(DataMode::Rt),
            "delayed" => Ok(DataMode::Delayed),
            other => Err(format!("unknown mode {other:?}, expected rt or delayed")),
        }
    }
}

impl FromStr for DataLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sci" => Ok(DataLevel::Sci),
            "ngdac" => Ok(DataLevel::Ngdac),
            other => Err(format!("unknown level {other:?}, expected sci or ngdac")),
        }
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DataLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentLayout {
    root: PathBuf,
    name: String,
    dir: PathBuf,
    mode: DataMode,
    level: DataLevel,
}

impl DeploymentLayout {
    /// Resolve `name` (`glider-YYYYmmddTHHMM`) under `root` for the datasets
    /// of one mode and level.
    pub fn new(
        root: impl AsRef<Path>,
        name: &str,
        mode: DataMode,
        level: DataLevel,
    ) -> StorageResult<Self> {
        let invalid = |reason: &str| StorageError::InvalidDeployment {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let (glider, trajectory) = name
            .rsplit_once('-')
            .ok_or_else(|| invalid("expected glider-YYYYmmddTHHMM"))?;
        if glider.is_empty() {
            return Err(invalid("missing glider name"));
        }
        let started = NaiveDateTime::parse_from_str(trajectory, "%Y%m%dT%H%M")
            .map_err(|_| invalid("unparseable deployment timestamp"))?;

        let root = root.as_ref().to_path_buf();
        let dir = root
            .join("deployments")
            .join(started.year().to_string())
            .join(name);
        Ok(Self {
            root,
            name: name.to_string(),
            dir,
            mode,
            level,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    pub fn level(&self) -> DataLevel {
        self.level
    }

    /// Directory QC'd datasets are published from.
    pub fn data_dir(&self) -> PathBuf {
        self.dir
            .join("data")
            .join("out")
            .join("nc")
            .join(format!("{}-{CDM_DATA_TYPE}", self.level))
            .join(self.mode.as_str())
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir().join("queue")
    }

    pub fn deployment_config(&self) -> PathBuf {
        self.dir.join("config").join("qc").join(CONFIG_FILE)
    }

    pub fn default_config(&self) -> PathBuf {
        self.root.join("qc").join("config").join(CONFIG_FILE)
    }

    /// Deployment config if present, else the default config if present.
    pub fn resolve_config(&self) -> Option<PathBuf> {
        [self.deployment_config(), self.default_config()]
            .into_iter()
            .find(|path| path.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: impl AsRef<Path>, name: &str) -> StorageResult<DeploymentLayout> {
        DeploymentLayout::new(root, name, DataMode::Rt, DataLevel::Sci)
    }

    #[test]
    fn test_layout_paths() {
        let layout = layout("/data", "ru30-20210503T1929").unwrap();
        assert_eq!(layout.dir(), Path::new("/data/deployments/2021/ru30-20210503T1929"));
        assert_eq!(
            layout.data_dir(),
            PathBuf::from("/data/deployments/2021/ru30-20210503T1929/data/out/nc/sci-profile/rt")
        );
        assert_eq!(
            layout.queue_dir(),
            PathBuf::from("/data/deployments/2021/ru30-20210503T1929/data/out/nc/sci-profile/rt/queue")
        );
        assert_eq!(layout.default_config(), PathBuf::from("/data/qc/config/qc.yml"));
    }

    #[test]
    fn test_mode_and_level_select_data_dir() {
        let layout =
            DeploymentLayout::new("/data", "ru30-20210503T1929", DataMode::Delayed, DataLevel::Ngdac)
                .unwrap();
        assert!(layout.queue_dir().ends_with("data/out/nc/ngdac-profile/delayed/queue"));
        assert_eq!(layout.queue_dir().parent(), Some(layout.data_dir().as_path()));
    }

    #[test]
    fn test_parse_mode_and_level() {
        assert_eq!("rt".parse::<DataMode>(), Ok(DataMode::Rt));
        assert_eq!("delayed".parse::<DataMode>(), Ok(DataMode::Delayed));
        assert_eq!("ngdac".parse::<DataLevel>(), Ok(DataLevel::Ngdac));
        assert!("realtime".parse::<DataMode>().is_err());
        assert!("raw".parse::<DataLevel>().is_err());
    }

    #[test]
    fn test_glider_names_with_underscores() {
        let layout = layout("/data", "maracoos_02-20210716T1814").unwrap();
        assert!(layout.dir().ends_with("2021/maracoos_02-20210716T1814"));
    }

    #[test]
    fn test_invalid_names() {
        for name in ["ru30", "ru30-2021", "-20210503T1929", "ru30-20211303T1929"] {
            assert!(
                matches!(layout("/data", name), Err(StorageError::InvalidDeployment { .. })),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_deployment_config_overrides_default() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path(), "ru30-20210503T1929").unwrap();
        assert_eq!(layout.resolve_config(), None);

        std::fs::create_dir_all(layout.default_config().parent().unwrap()).unwrap();
        std::fs::write(layout.default_config(), "qartod: []\n").unwrap();
        assert_eq!(layout.resolve_config(), Some(layout.default_config()));

        std::fs::create_dir_all(layout.deployment_config().parent().unwrap()).unwrap();
        std::fs::write(layout.deployment_config(), "qartod: []\n").unwrap();
        assert_eq!(layout.resolve_config(), Some(layout.deployment_config()));
    }
}
