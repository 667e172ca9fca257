//! Trigger policies: when to inject.
//!
//! One state machine (`Idle -> Armed -> Fired -> Done`) with three
//! interchangeable strategies. Instruction counting single-steps the tracee
//! and is precise but pays one trap per instruction; wall time runs the
//! tracee freely and stops it asynchronously after a random sleep, one
//! round-trip total; immediate fires at the initial exec stop before the
//! target has run a single own instruction.

use crate::controller::{RunState, TracedProcess};
use crate::error::TrialError;
use log::{debug, info};
use nix::errno::Errno;
use std::ops::Range;
use std::thread;
use std::time::Duration;

/// Strategy selection plus its parameters. Immutable once constructed.
#[derive(Clone, Debug)]
pub enum TriggerConfig {
    /// Single-step until a threshold drawn uniformly from the range of
    /// executed-instruction counts is reached.
    InstructionCount { range: Range<u64> },
    /// Run freely, sleep a duration drawn uniformly from the range (in
    /// microseconds), then request an asynchronous stop.
    WallTime { range_us: Range<u64> },
    /// Fire at the first confirmed stop after attach.
    Immediate,
}

/// Trigger lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Armed,
    Fired,
    Done,
}

/// What `run` resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Condition met, tracee confirmed stopped and ready for injection.
    Fired,
    /// The tracee exited or was killed before the condition was met; no
    /// injection must be attempted.
    Aborted,
}

/// One trigger instance, consumed by a single trial.
pub struct Trigger {
    config: TriggerConfig,
    state: TriggerState,
    steps_taken: u64,
    stop_requests: u32,
}

impl Trigger {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            state: TriggerState::Idle,
            steps_taken: 0,
            stop_requests: 0,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Single-step round-trips performed before firing.
    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    /// Asynchronous stop requests issued; at most one per trial.
    pub fn stop_requests(&self) -> u32 {
        self.stop_requests
    }

    /// Arm the trigger against an attached, confirmed-stopped tracee.
    pub fn arm(&mut self, tracee: &TracedProcess) -> Result<(), TrialError> {
        if self.state != TriggerState::Idle || tracee.state() != RunState::Stopped {
            return Err(TrialError::AccessError {
                op: "trigger arm",
                state: tracee.state(),
                errno: Errno::EBUSY,
            });
        }
        self.state = TriggerState::Armed;
        Ok(())
    }

    /// Block until the fire condition is met or the tracee is gone.
    ///
    /// On `Fired` the tracee is confirmed stopped and the trigger stays in
    /// `Fired` until [`Self::complete`]. On `Aborted` the trigger goes
    /// straight to `Done` and the caller must not touch registers.
    pub fn run(
        &mut self,
        tracee: &mut TracedProcess,
        rng: &mut impl rand::Rng,
    ) -> Result<TriggerOutcome, TrialError> {
        assert_eq!(self.state, TriggerState::Armed, "trigger must be armed");
        let outcome = match self.config.clone() {
            TriggerConfig::InstructionCount { range } => self.run_counted(tracee, rng.gen_range(range)),
            TriggerConfig::WallTime { range_us } => self.run_timed(tracee, rng.gen_range(range_us)),
            TriggerConfig::Immediate => {
                // The tracee is still in its initial stop; nothing of the
                // target's own code has executed.
                info!("firing at the initial stop");
                Ok(TriggerOutcome::Fired)
            }
        }?;
        self.state = match outcome {
            TriggerOutcome::Fired => TriggerState::Fired,
            TriggerOutcome::Aborted => TriggerState::Done,
        };
        Ok(outcome)
    }

    /// The controller consumed the fire event (registers written, about to
    /// resume).
    pub fn complete(&mut self) {
        assert_eq!(self.state, TriggerState::Fired);
        self.state = TriggerState::Done;
    }

    /// Step-and-wait until `threshold` instructions have executed. Each
    /// round-trip is one trap; precise but expensive.
    fn run_counted(
        &mut self,
        tracee: &mut TracedProcess,
        threshold: u64,
    ) -> Result<TriggerOutcome, TrialError> {
        debug!("single-stepping {threshold} instructions before injection");
        while self.steps_taken < threshold {
            match tracee.single_step()? {
                RunState::Stopped => self.steps_taken += 1,
                // Tracee finished first; valid no-injection outcome.
                _ => return Ok(TriggerOutcome::Aborted),
            }
        }
        info!("fired after {} single-steps", self.steps_taken);
        Ok(TriggerOutcome::Fired)
    }

    /// Resume, sleep, request one asynchronous stop, wait for it. Cheap but
    /// imprecise with respect to instruction count.
    fn run_timed(
        &mut self,
        tracee: &mut TracedProcess,
        delay_us: u64,
    ) -> Result<TriggerOutcome, TrialError> {
        debug!("running tracee freely for {delay_us}us before injection");
        tracee.resume()?;
        thread::sleep(Duration::from_micros(delay_us));
        match tracee.request_stop() {
            Ok(()) => self.stop_requests += 1,
            // Already gone; fall through to wait for the exit status.
            Err(TrialError::TraceeLost { errno: Errno::ESRCH, .. }) => {}
            Err(error) => return Err(error),
        }
        loop {
            match tracee.wait()? {
                RunState::Stopped => {
                    info!("fired after {delay_us}us of free running");
                    return Ok(TriggerOutcome::Fired);
                }
                RunState::Exited(_) | RunState::Killed(_) => {
                    return Ok(TriggerOutcome::Aborted);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn new_trigger_is_idle() {
        let trigger = Trigger::new(TriggerConfig::Immediate);
        assert_eq!(trigger.state(), TriggerState::Idle);
        assert_eq!(trigger.steps_taken(), 0);
        assert_eq!(trigger.stop_requests(), 0);
    }

    #[test]
    fn threshold_sampling_stays_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..10_000 {
            let threshold = rng.gen_range(10_000u64..60_000);
            assert!((10_000..60_000).contains(&threshold));
        }
    }
}
