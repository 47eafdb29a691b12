//! Per-session protocol state shared by all family variants.
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Negotiation progress. Moves forward only, [`Phase::Ended`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    Connected,
    DeviceSelected,
    SpeedChanged,
    ProgramErase,
    Ended,
}

/// Sub-mode inside [`Phase::ProgramErase`]. Erase and write selection are
/// mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Selection {
    #[default]
    Idle,
    Erase,
    WriteArea,
}

/// Result of the one-time whole-device blank check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlankState {
    #[default]
    NotChecked,
    BlankAll,
    NotBlank,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    phase: Phase,
    pub selection: Selection,
    pub blank: BlankState,
    erased: BTreeSet<u32>,
    /// Set by a failed page write, cleared by a new write area selection.
    pub write_failed: bool,
    /// ID code protection enabled and not unlocked: flash is read-only.
    pub id_protected: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Advance to `phase`. Going backwards is a contract violation.
    pub fn advance(&mut self, phase: Phase) -> Result<()> {
        if phase < self.phase {
            return Err(Error::NotReady("session state cannot move backwards"));
        }
        log::debug!("session {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        Ok(())
    }

    pub fn end(&mut self) {
        self.phase = Phase::Ended;
        self.selection = Selection::Idle;
    }

    /// Fail with `NotReady` unless exactly in `phase`.
    pub fn require(&self, phase: Phase, what: &'static str) -> Result<()> {
        if self.phase != phase {
            return Err(Error::NotReady(what));
        }
        Ok(())
    }

    /// Fail with `NotReady` unless in P/E mode, and with `IdProtected` when
    /// the flash cannot be modified.
    pub fn require_writable(&self, what: &'static str) -> Result<()> {
        self.require(Phase::ProgramErase, what)?;
        if self.id_protected {
            return Err(Error::IdProtected);
        }
        Ok(())
    }

    pub fn is_erased(&self, unit: u32) -> bool {
        self.erased.contains(&unit)
    }

    /// Record an erase unit, returns `false` if it was already recorded.
    pub fn mark_erased(&mut self, unit: u32) -> bool {
        self.erased.insert(unit)
    }

    pub fn erased_count(&self) -> usize {
        self.erased.len()
    }
}
