// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;

/// Text commands a peer may send over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start accumulating update frames into a fresh calibration profile.
    CalibrationBegin,
    /// Average the accumulated frames and persist them.
    CalibrationEnd,
    /// Reload the persisted profile and apply it to outgoing updates.
    CalibrationLoad,
}

impl Command {
    /// Match a text message, ignoring surrounding whitespace. Anything else
    /// is not a command.
    pub fn parse(text: &str) -> Option<Command> {
        match text.trim() {
            "CALIBRATION BEGIN" => Some(Command::CalibrationBegin),
            "CALIBRATION END" => Some(Command::CalibrationEnd),
            "CALIBRATION LOAD" => Some(Command::CalibrationLoad),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::CalibrationBegin => "CALIBRATION BEGIN",
            Command::CalibrationEnd => "CALIBRATION END",
            Command::CalibrationLoad => "CALIBRATION LOAD",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
