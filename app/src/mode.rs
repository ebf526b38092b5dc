use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Scheduled,
    Custom,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Scheduled => "scheduled",
            Mode::Custom => "custom",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Owner of the process-wide mode flag. Only the orchestrator holds one, so
/// only the orchestrator can change it. Not persisted: a restart is always
/// back in `Scheduled`.
#[derive(Debug, Default)]
pub struct ModeState {
    current: Mode,
}

impl ModeState {
    pub fn current(&self) -> Mode {
        self.current
    }

    pub fn is_custom(&self) -> bool {
        self.current == Mode::Custom
    }

    pub(crate) fn set(&mut self, mode: Mode) {
        self.current = mode;
    }
}
