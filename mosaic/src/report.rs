//! Progress reporting for mosaicking runs
//!
//! Components never log through a global; they receive a [`Reporter`] and
//! emit [`RunEvent`]s. [`LogReporter`] forwards to the `log` facade,
//! [`CollectingReporter`] keeps events in memory.

use crate::psf::PsfDescriptor;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    ResolutionTargets,
    Convolution,
    Reprojection,
    Combination,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "pre-flight checks",
            Stage::ResolutionTargets => "resolution target selection",
            Stage::Convolution => "convolution to common resolution",
            Stage::Reprojection => "reprojection onto the mosaic grid",
            Stage::Combination => "beam-weighted combination",
            Stage::Output => "writing outputs",
        };
        write!(f, "{name}")
    }
}

/// Something worth telling the user about
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    StageStarted(Stage),
    /// Target PSF chosen for a channel
    TargetSelected {
        channel: usize,
        target: PsfDescriptor,
    },
    /// A (pointing, channel) unit was convolved with `kernel`
    KernelApplied {
        pointing: String,
        channel: usize,
        kernel: PsfDescriptor,
        result: PsfDescriptor,
    },
    /// Native PSF already matched the target
    PassThrough {
        pointing: String,
        channel: usize,
    },
    Reprojected {
        pointing: String,
    },
    ArtifactWritten(PathBuf),
    Info(String),
    Warning(String),
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::StageStarted(stage) => write!(f, "Starting {stage}"),
            RunEvent::TargetSelected { channel, target } => {
                write!(f, "Channel {channel}: target PSF {target}")
            }
            RunEvent::KernelApplied {
                pointing,
                channel,
                kernel,
                result,
            } => write!(
                f,
                "{pointing} channel {channel}: convolved with {kernel}, resulting PSF {result}"
            ),
            RunEvent::PassThrough { pointing, channel } => write!(
                f,
                "{pointing} channel {channel}: already at target resolution, not convolved"
            ),
            RunEvent::Reprojected { pointing } => write!(f, "{pointing}: reprojected"),
            RunEvent::ArtifactWritten(path) => write!(f, "Wrote {}", path.display()),
            RunEvent::Info(message) | RunEvent::Warning(message) => write!(f, "{message}"),
        }
    }
}

/// Sink for run events, shared across convolution workers
pub trait Reporter: Send + Sync {
    fn report(&self, event: RunEvent);

    fn stage(&self, stage: Stage) {
        self.report(RunEvent::StageStarted(stage));
    }

    fn info(&self, message: String) {
        self.report(RunEvent::Info(message));
    }

    fn warn(&self, message: String) {
        self.report(RunEvent::Warning(message));
    }
}

/// Forwards events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: RunEvent) {
        match &event {
            RunEvent::Warning(_) => log::warn!("{event}"),
            RunEvent::StageStarted(_)
            | RunEvent::TargetSelected { .. }
            | RunEvent::ArtifactWritten(_)
            | RunEvent::Info(_) => log::info!("{event}"),
            RunEvent::KernelApplied { .. }
            | RunEvent::PassThrough { .. }
            | RunEvent::Reprojected { .. } => log::debug!("{event}"),
        }
    }
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<RunEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::Warning(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: RunEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
