use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::models::{ExecutionPhase, ExecutionProgress};

/// Prefix the worker puts in front of a progress JSON object on stdout.
pub const PROGRESS_MARKER: &str = "__EXEC_PHASE__:";

/// Printed by a worker that wants to be re-spawned (e.g. after switching
/// execution profile on a rate limit).
pub const RESTART_MARKER: &str = "__RESTART_REQUESTED__";

/// A progress notification as it travels from worker to reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ExecutionPhase,
    pub phase_progress: u8,
    pub overall_progress: u8,
    pub sequence_number: u64,
}

impl ProgressEvent {
    pub fn new(phase: ExecutionPhase, sequence_number: u64) -> Self {
        Self {
            phase,
            phase_progress: 0,
            overall_progress: 0,
            sequence_number,
        }
    }
}

/// Wire shape of the JSON after [`PROGRESS_MARKER`]. Percentages are clamped
/// on conversion, so out-of-range values from the worker never reach a task.
#[derive(Debug, Deserialize)]
struct ProgressLine {
    phase: ExecutionPhase,
    #[serde(default, alias = "phaseProgress")]
    phase_progress: Option<f64>,
    #[serde(default, alias = "overallProgress", alias = "progress")]
    overall_progress: Option<f64>,
    #[serde(default, alias = "sequenceNumber", alias = "seq")]
    sequence_number: Option<u64>,
}

fn clamp_percent(value: Option<f64>) -> u8 {
    value.map(|v| v.clamp(0.0, 100.0) as u8).unwrap_or(0)
}

/// What one line of worker stdout turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Progress(ProgressEvent),
    RestartRequested,
    Log,
}

/// Classify a stdout line. Progress lines with no sequence number come back
/// with `sequence_number == 0`; [`SequenceCounter::stamp`] fills it in.
pub fn parse_line(line: &str) -> LineKind {
    let trimmed = line.trim();
    if let Some(start) = trimmed.find(PROGRESS_MARKER) {
        let payload = trimmed[start + PROGRESS_MARKER.len()..].trim();
        return match serde_json::from_str::<ProgressLine>(payload) {
            Ok(parsed) => LineKind::Progress(ProgressEvent {
                phase: parsed.phase,
                phase_progress: clamp_percent(parsed.phase_progress),
                overall_progress: clamp_percent(parsed.overall_progress),
                sequence_number: parsed.sequence_number.unwrap_or(0),
            }),
            Err(e) => {
                tracing::debug!(error = %e, "unparseable progress line, treating as log");
                LineKind::Log
            }
        };
    }
    if trimmed.contains(RESTART_MARKER) {
        return LineKind::RestartRequested;
    }
    LineKind::Log
}

/// Per-task sequence counter shared by every worker spawned for the task,
/// so numbering keeps climbing across restarts.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next number to an unnumbered event, or advance the counter
    /// past a number the worker supplied itself.
    pub fn stamp(&self, mut event: ProgressEvent) -> ProgressEvent {
        if event.sequence_number == 0 {
            event.sequence_number = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        } else {
            self.0.fetch_max(event.sequence_number, Ordering::SeqCst);
        }
        event
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressClass {
    PhaseChange {
        from: ExecutionPhase,
        to: ExecutionPhase,
    },
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept(ProgressClass),
    Stale { stored: u64, incoming: u64 },
}

/// Sequencing filter in front of the reconciler. Holds no queue: an event is
/// either applied now or dropped.
pub fn gate(current: &ExecutionProgress, event: &ProgressEvent) -> GateDecision {
    let stored = current.sequence_number;
    let incoming = event.sequence_number;
    if stored != 0 && incoming != 0 && incoming < stored {
        return GateDecision::Stale { stored, incoming };
    }
    if current.phase != event.phase {
        GateDecision::Accept(ProgressClass::PhaseChange {
            from: current.phase,
            to: event.phase,
        })
    } else {
        GateDecision::Accept(ProgressClass::Tick)
    }
}
