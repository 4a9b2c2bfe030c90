//! Fsck repair decisions.
//!
//! A check pass feeds every problem it finds through an [`FsckContext`]. The
//! context applies the configured [`FixPolicy`], records a finding, and tells
//! the caller whether to repair. Problems that may not be skipped and were not
//! fixed stop the pass; the caller observes this at its next
//! [`FsckContext::checkpoint`] or through the returned error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::fault::{FaultHandler, Subsystem};

/// Fix policy for fsck-fixable problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FixPolicy {
    /// Report only.
    No,
    /// Always fix.
    Yes,
    /// Ask through a [`FixPrompt`].
    #[default]
    Ask,
}

impl FromStr for FixPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "n" => Ok(FixPolicy::No),
            "yes" | "y" => Ok(FixPolicy::Yes),
            "ask" => Ok(FixPolicy::Ask),
            other => Err(format!("unknown fix policy '{other}', expected no, yes or ask")),
        }
    }
}

impl fmt::Display for FixPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FixPolicy::No => "no",
            FixPolicy::Yes => "yes",
            FixPolicy::Ask => "ask",
        })
    }
}

/// Answers interactive fix questions.
pub trait FixPrompt: Send + Sync {
    /// Returns true to fix the described problem.
    fn ask(&self, question: &str) -> bool;
}

/// Prompt that declines every fix, used when nobody can answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclinePrompt;

impl FixPrompt for DeclinePrompt {
    fn ask(&self, _question: &str) -> bool {
        false
    }
}

/// Fsck exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FsckExit {
    /// No errors remain.
    Ok,
    /// Errors were found and left unfixed.
    ErrorsNotFixed,
    /// A problem needs a repair that does not exist yet.
    RepairUnimplemented,
    /// A problem cannot be repaired.
    RepairImpossible,
    /// The on-disk format version is not understood.
    UnknownVersion,
}

impl FsckExit {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            FsckExit::Ok => 0,
            FsckExit::ErrorsNotFixed => 1,
            FsckExit::RepairUnimplemented => 2,
            FsckExit::RepairImpossible => 3,
            FsckExit::UnknownVersion => 4,
        }
    }
}

impl fmt::Display for FsckExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsckExit::Ok => "clean",
            FsckExit::ErrorsNotFixed => "errors not fixed",
            FsckExit::RepairUnimplemented => "repair unimplemented",
            FsckExit::RepairImpossible => "repair impossible",
            FsckExit::UnknownVersion => "unknown version",
        };
        write!(f, "{} (exit {})", s, self.code())
    }
}

/// One problem found by fsck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsckFinding {
    /// Subsystem the problem was found in.
    pub subsystem: Subsystem,
    /// Description of the problem.
    pub message: String,
    /// Whether a repair exists.
    pub can_fix: bool,
    /// Whether the pass may continue without fixing.
    pub can_ignore: bool,
    /// Whether it was repaired.
    pub fixed: bool,
}

/// Summary of a check pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsckReport {
    /// All findings in detection order.
    pub findings: Vec<FsckFinding>,
    /// Number of findings repaired.
    pub fixed: usize,
    /// Number of findings left in place.
    pub unfixed: usize,
    /// Resulting exit status.
    pub exit: FsckExit,
}

impl FsckReport {
    /// Report for a pass that could not even read the format.
    pub fn unknown_version(version: u32) -> Self {
        Self {
            findings: vec![FsckFinding {
                subsystem: Subsystem::Superblock,
                message: format!("unknown on-disk version {version}"),
                can_fix: false,
                can_ignore: false,
                fixed: false,
            }],
            fixed: 0,
            unfixed: 1,
            exit: FsckExit::UnknownVersion,
        }
    }

    /// True if nothing was found.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Accumulates fsck findings and applies the fix policy.
pub struct FsckContext {
    policy: FixPolicy,
    prompt: Arc<dyn FixPrompt>,
    faults: Option<Arc<FaultHandler>>,
    findings: Vec<FsckFinding>,
    unimplemented: bool,
    halted: Option<FsckExit>,
}

impl FsckContext {
    /// Creates a context; `prompt` answers [`FixPolicy::Ask`] questions.
    pub fn new(policy: FixPolicy, prompt: Arc<dyn FixPrompt>) -> Self {
        Self {
            policy,
            prompt,
            faults: None,
            findings: Vec::new(),
            unimplemented: false,
            halted: None,
        }
    }

    /// Context that reports only.
    pub fn report_only() -> Self {
        Self::new(FixPolicy::No, Arc::new(DeclinePrompt))
    }

    /// Mirrors findings into the mount's fault handler.
    pub fn with_faults(mut self, faults: Arc<FaultHandler>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Like [`Self::with_faults`] on a borrowed context. Findings recorded
    /// so far are mirrored too.
    pub fn attach_faults(&mut self, faults: Arc<FaultHandler>) {
        for f in &self.findings {
            faults.fsck_finding(f.subsystem, f.message.clone(), f.fixed);
        }
        self.faults = Some(faults);
    }

    /// Configured policy.
    pub fn policy(&self) -> FixPolicy {
        self.policy
    }

    fn decide(
        &mut self,
        subsystem: Subsystem,
        can_fix: bool,
        can_ignore: bool,
        nofix_msg: &str,
        message: String,
    ) -> EngineResult<bool> {
        self.checkpoint()?;

        let fix = if can_fix {
            match self.policy {
                FixPolicy::Yes => true,
                FixPolicy::No => false,
                FixPolicy::Ask => self.prompt.ask(&format!("{message}, fix?")),
            }
        } else {
            false
        };

        if fix {
            info!(%subsystem, "{message}, fixing");
        } else if can_fix {
            warn!(%subsystem, "{message}, not fixing");
        } else {
            warn!(%subsystem, "{message}, {nofix_msg}");
        }

        if let Some(faults) = &self.faults {
            faults.fsck_finding(subsystem, message.clone(), fix);
        }
        self.findings.push(FsckFinding {
            subsystem,
            message,
            can_fix,
            can_ignore,
            fixed: fix,
        });

        if !fix && !can_ignore {
            error!(%subsystem, "Unable to continue, halting");
            self.halted = Some(FsckExit::ErrorsNotFixed);
            return Err(EngineError::FsckHalted(FsckExit::ErrorsNotFixed));
        }
        Ok(fix)
    }

    /// A fixable, ignorable problem. Returns whether to repair it.
    pub fn fsck_err(&mut self, subsystem: Subsystem, message: impl Into<String>) -> EngineResult<bool> {
        self.decide(subsystem, true, true, "not fixing", message.into())
    }

    /// [`Self::fsck_err`] when `cond` holds; otherwise `Ok(false)`.
    pub fn fsck_err_on(
        &mut self,
        cond: bool,
        subsystem: Subsystem,
        message: impl Into<String>,
    ) -> EngineResult<bool> {
        if !cond {
            return Ok(false);
        }
        self.fsck_err(subsystem, message)
    }

    /// A problem that must be fixed for the pass to continue.
    pub fn mustfix_fsck_err_on(
        &mut self,
        cond: bool,
        subsystem: Subsystem,
        message: impl Into<String>,
    ) -> EngineResult<bool> {
        if !cond {
            return Ok(false);
        }
        self.decide(subsystem, true, false, "not fixing", message.into())
    }

    /// A problem that cannot be repaired here but does not block the pass.
    pub fn need_fsck_err_on(
        &mut self,
        cond: bool,
        subsystem: Subsystem,
        message: impl Into<String>,
    ) -> EngineResult<bool> {
        if !cond {
            return Ok(false);
        }
        self.decide(subsystem, false, true, "run fsck to correct", message.into())
    }

    /// A problem with no repair implemented; ignorable.
    pub fn unfixable_fsck_err_on(
        &mut self,
        cond: bool,
        subsystem: Subsystem,
        message: impl Into<String>,
    ) -> EngineResult<bool> {
        if !cond {
            return Ok(false);
        }
        self.unimplemented = true;
        self.decide(subsystem, false, true, "repair unimplemented", message.into())
    }

    /// A problem that can never be repaired. Stops the pass.
    #[must_use]
    pub fn impossible(&mut self, subsystem: Subsystem, message: impl Into<String>) -> EngineError {
        let message = message.into();
        error!(%subsystem, "{message}, repair impossible");
        if let Some(faults) = &self.faults {
            faults.fsck_finding(subsystem, message.clone(), false);
        }
        self.findings.push(FsckFinding {
            subsystem,
            message,
            can_fix: false,
            can_ignore: false,
            fixed: false,
        });
        let exit = self
            .halted
            .map_or(FsckExit::RepairImpossible, |h| h.max(FsckExit::RepairImpossible));
        self.halted = Some(exit);
        EngineError::FsckHalted(exit)
    }

    /// Fails once the pass has halted.
    pub fn checkpoint(&self) -> EngineResult<()> {
        match self.halted {
            Some(exit) => Err(EngineError::FsckHalted(exit)),
            None => Ok(()),
        }
    }

    /// Whether the pass has halted.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Findings so far.
    pub fn findings(&self) -> &[FsckFinding] {
        &self.findings
    }

    /// Number of findings left unfixed.
    pub fn unfixed(&self) -> usize {
        self.findings.iter().filter(|f| !f.fixed).count()
    }

    /// Closes the pass and computes the exit status.
    pub fn finish(self) -> FsckReport {
        let fixed = self.findings.iter().filter(|f| f.fixed).count();
        let unfixed = self.findings.len() - fixed;
        let exit = match self.halted {
            Some(exit) => exit,
            None if self.unimplemented => FsckExit::RepairUnimplemented,
            None if unfixed > 0 => FsckExit::ErrorsNotFixed,
            None => FsckExit::Ok,
        };
        FsckReport {
            findings: self.findings,
            fixed,
            unfixed,
            exit,
        }
    }
}

impl fmt::Debug for FsckContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsckContext")
            .field("policy", &self.policy)
            .field("findings", &self.findings.len())
            .field("halted", &self.halted)
            .finish()
    }
}
