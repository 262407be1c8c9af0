use std::fmt;

use serde::{Deserialize, Serialize};

/// Steps applied to each profile, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcStage {
    Parse,
    Dedup,
    Qartod,
    Hysteresis,
    Summary,
}

impl QcStage {
    /// Flag-writing stages. Both tests must finish before the summary.
    pub const FLAGGING: [QcStage; 3] = [QcStage::Qartod, QcStage::Hysteresis, QcStage::Summary];

    pub fn as_str(self) -> &'static str {
        match self {
            QcStage::Parse => "parse",
            QcStage::Dedup => "dedup",
            QcStage::Qartod => "qartod",
            QcStage::Hysteresis => "hysteresis",
            QcStage::Summary => "summary",
        }
    }
}

impl fmt::Display for QcStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
