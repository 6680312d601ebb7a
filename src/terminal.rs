use std::io::IsTerminal;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

use crate::protocol::Geometry;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
    #[error("stdin is not a terminal")]
    NotATerminal,
}

/// RAII guard for terminal raw mode.
///
/// Raw mode lets every keystroke (Ctrl+C included) reach the remote shell
/// instead of the local line discipline. Dropping the guard, even during a
/// panic unwind, restores the local terminal.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        if !std::io::stdin().is_terminal() {
            return Err(TerminalError::NotATerminal);
        }
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Size of the local terminal.
pub fn terminal_geometry() -> anyhow::Result<Geometry> {
    let (cols, rows) = size()?;
    Ok(Geometry::new(cols, rows))
}

/// Size of the local terminal, or `fallback` when there is none (e.g. output
/// piped to a file) or it reports zero.
pub fn terminal_geometry_or(fallback: Geometry) -> Geometry {
    match terminal_geometry() {
        Ok(g) if g.cols > 0 && g.rows > 0 => g,
        _ => fallback,
    }
}
