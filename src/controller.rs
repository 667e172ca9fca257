//! Process controller: owns the tracee's lifecycle for one trial.
//!
//! The controller forks/execs the target under ptrace, drives the configured
//! trigger policy, injects at most one register bit flip through the register
//! access layer, resumes the tracee and reaps it. Every tracee-resuming call
//! is paired with a blocking wait; the controller never proceeds while the
//! tracee's state is unknown.

use crate::error::TrialError;
use crate::fault::{self, FaultSpec};
use crate::registers::{RegisterSnapshot, REGISTER_WIDTH};
use crate::trigger::{Trigger, TriggerConfig, TriggerOutcome};
use log::{debug, info, warn};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of the tracee, as last confirmed through waitpid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Stopped,
    Exited(i32),
    Killed(Signal),
}

/// Final disposition of the target program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by a signal (e.g. SIGSEGV after a pc corruption).
    Signaled(Signal),
    /// The tracee was lost before a disposition could be observed.
    Inconclusive,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Exited(code) => write!(f, "exit code {code}"),
            Disposition::Signaled(signal) => write!(f, "terminated by {signal}"),
            Disposition::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// The tracee, owned exclusively by the controller for its lifetime.
pub struct TracedProcess {
    pid: Pid,
    state: RunState,
    /// Signal that caused the last stop, forwarded on resume so the target
    /// observes faults (e.g. a SIGSEGV) exactly as it would untraced.
    pending_signal: Option<Signal>,
}

impl TracedProcess {
    /// Fork and exec the target under tracing, then block until its initial
    /// stop (post-exec, pre-first-instruction).
    ///
    /// A failed exec never falls through into the parent's logic: the child
    /// dies inside `Command`'s exec path and the failure surfaces here as an
    /// `AttachFailure`.
    pub fn spawn(target: &Path, args: &[String]) -> Result<Self, TrialError> {
        let mut command = Command::new(target);
        command.args(args);
        unsafe {
            command.pre_exec(|| {
                // Request to be traced; the exec then delivers a SIGTRAP stop
                // before the target's first instruction.
                ptrace::traceme()
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }
        let child = command.spawn().map_err(|source| TrialError::AttachFailure {
            target: target.to_path_buf(),
            source,
        })?;
        let mut tracee = Self {
            pid: Pid::from_raw(child.id() as i32),
            state: RunState::Starting,
            pending_signal: None,
        };
        // Reaping happens through waitpid below, not through the std handle.
        drop(child);

        match tracee.wait() {
            Ok(RunState::Stopped) => {}
            Ok(state) => {
                return Err(attach_failure(target, format!("tracee reached {state:?} before its initial stop")));
            }
            Err(error) => {
                return Err(attach_failure(target, format!("initial wait failed: {error}")));
            }
        }
        // Tie the tracee's fate to the controller's: if the controller dies
        // before reaping, the kernel kills the tracee instead of leaving it
        // suspended.
        ptrace::setoptions(tracee.pid, ptrace::Options::PTRACE_O_EXITKILL)
            .map_err(|errno| attach_failure(target, format!("PTRACE_SETOPTIONS failed: {errno}")))?;
        debug!("tracee {} attached and stopped at exec", tracee.pid);
        Ok(tracee)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.state,
            RunState::Starting | RunState::Running | RunState::Stopped
        )
    }

    /// Final disposition, once the tracee has exited or been killed.
    pub fn disposition(&self) -> Option<Disposition> {
        match self.state {
            RunState::Exited(code) => Some(Disposition::Exited(code)),
            RunState::Killed(signal) => Some(Disposition::Signaled(signal)),
            _ => None,
        }
    }

    /// Block until the tracee's next stop or termination.
    pub fn wait(&mut self) -> Result<RunState, TrialError> {
        let status = waitpid(self.pid, None).map_err(|errno| TrialError::TraceeLost {
            pid: self.pid.as_raw(),
            errno,
        })?;
        self.state = match status {
            WaitStatus::Exited(_, code) => RunState::Exited(code),
            WaitStatus::Signaled(_, signal, _) => RunState::Killed(signal),
            WaitStatus::Stopped(_, signal) => {
                self.pending_signal = Some(signal);
                RunState::Stopped
            }
            WaitStatus::PtraceEvent(_, signal, _) => {
                self.pending_signal = Some(signal);
                RunState::Stopped
            }
            _ => self.state,
        };
        Ok(self.state)
    }

    /// Resume for exactly one instruction and block until the re-stop (or
    /// the tracee's termination, whichever comes first).
    pub fn single_step(&mut self) -> Result<RunState, TrialError> {
        ptrace::step(self.pid, None).map_err(|errno| TrialError::TraceeLost {
            pid: self.pid.as_raw(),
            errno,
        })?;
        self.state = RunState::Running;
        self.pending_signal = None;
        self.wait()
    }

    /// Resume the tracee, forwarding a pending fault signal so its default
    /// action (e.g. the process dying of SIGSEGV) takes effect. Trace traps
    /// and our own SIGSTOPs are suppressed.
    pub fn resume(&mut self) -> Result<(), TrialError> {
        let forward = match self.pending_signal.take() {
            Some(Signal::SIGTRAP) | Some(Signal::SIGSTOP) | None => None,
            signal => signal,
        };
        ptrace::cont(self.pid, forward).map_err(|errno| TrialError::TraceeLost {
            pid: self.pid.as_raw(),
            errno,
        })?;
        self.state = RunState::Running;
        Ok(())
    }

    /// Ask a running tracee to stop asynchronously. The caller must follow
    /// up with [`Self::wait`]; the stop is only a request until confirmed.
    pub fn request_stop(&mut self) -> Result<(), TrialError> {
        signal::kill(self.pid, Signal::SIGSTOP).map_err(|errno| TrialError::TraceeLost {
            pid: self.pid.as_raw(),
            errno,
        })
    }
}

impl Drop for TracedProcess {
    fn drop(&mut self) {
        // Teardown guarantee: never leave a stopped tracee suspended. Detach
        // lets it run untraced; if even that fails, kill it.
        if self.state == RunState::Stopped {
            warn!("dropping a stopped tracee {}, detaching", self.pid);
            if ptrace::detach(self.pid, None).is_err() {
                let _ = signal::kill(self.pid, Signal::SIGKILL);
            }
        }
    }
}

fn attach_failure(target: &Path, message: String) -> TrialError {
    TrialError::AttachFailure {
        target: target.to_path_buf(),
        source: std::io::Error::other(message),
    }
}

/// Configuration of one trial.
#[derive(Clone, Debug)]
pub struct TrialConfig {
    /// Path to the target executable.
    pub target: PathBuf,
    /// Arguments passed to the target.
    pub args: Vec<String>,
    /// When to inject.
    pub trigger: TriggerConfig,
    /// Number of register slots eligible for corruption, counted from slot 0.
    pub register_subset: usize,
    /// Fixed RNG seed; `None` reseeds from time ^ pid per trial.
    pub seed: Option<u64>,
}

/// Outcome of one trial: at most one fault, one disposition.
#[derive(Debug)]
pub struct InjectionResult {
    /// Seed the trial ran with, for replay.
    pub seed: u64,
    /// The applied fault, or `None` if the trigger never fired.
    pub fault: Option<FaultSpec>,
    /// How the target finished.
    pub disposition: Disposition,
    /// Trial-fatal error, if any. `None` together with `fault: None` means
    /// the tracee finished before the trigger fired (a valid outcome).
    pub error: Option<TrialError>,
}

impl InjectionResult {
    /// Machine-readable record, one `key value` line per field, for batch
    /// campaigns that parse per-run output.
    pub fn machine_record(&self) -> String {
        let mut record = String::new();
        record.push_str(&format!("seed {}\n", self.seed));
        record.push_str(&format!("injected {}\n", self.fault.is_some()));
        if let Some(fault) = &self.fault {
            record.push_str(&format!("register {}\n", crate::registers::slot_name(fault.register)));
            record.push_str(&format!("bit {}\n", fault.bit));
        }
        let disposition = match self.disposition {
            Disposition::Exited(code) => format!("exit {code}"),
            Disposition::Signaled(signal) => format!("signal {signal}"),
            Disposition::Inconclusive => "inconclusive".to_string(),
        };
        record.push_str(&format!("disposition {disposition}\n"));
        if let Some(error) = &self.error {
            record.push_str(&format!("error {error}\n"));
        }
        record
    }
}

/// Orchestrates one fault-injection trial end-to-end.
pub struct Controller {
    config: TrialConfig,
}

impl Controller {
    pub fn new(config: TrialConfig) -> Self {
        Self { config }
    }

    /// Run one trial: spawn, arm the trigger, inject on fire, resume, reap.
    ///
    /// Only an `AttachFailure` is returned as `Err` (no trial result exists
    /// without a tracee). Everything after attach is surfaced inside the
    /// `InjectionResult`; the external harness decides whether to retry.
    pub fn run_trial(&self) -> Result<InjectionResult, TrialError> {
        let seed = self.config.seed.unwrap_or_else(reseed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut tracee = TracedProcess::spawn(&self.config.target, &self.config.args)?;
        info!(
            "trial start: tracee {}, seed {seed}, trigger {:?}",
            tracee.pid(),
            self.config.trigger
        );

        let mut trigger = Trigger::new(self.config.trigger.clone());
        trigger.arm(&tracee)?;

        let mut fault = None;
        let mut error = None;
        match trigger.run(&mut tracee, &mut rng) {
            Ok(TriggerOutcome::Fired) => {
                // Any access failure here is fatal to the trial, but the
                // tracee is still resumed below so it is not left stopped.
                match self.inject(&tracee, &mut rng) {
                    Ok(spec) => fault = Some(spec),
                    Err(access) => {
                        warn!("injection failed: {access}");
                        error = Some(access);
                    }
                }
                trigger.complete();
            }
            Ok(TriggerOutcome::Aborted) => {
                info!("tracee finished before the trigger fired, no injection");
            }
            Err(lost) => {
                warn!("trigger lost the tracee: {lost}");
                error = Some(lost);
            }
        }

        // Resume unconditionally and drive the tracee to termination,
        // re-delivering any signals the fault provoked. A hung target hangs
        // this wait; wall-clock limits belong to the external harness.
        while tracee.is_alive() {
            let step = match tracee.state() {
                RunState::Stopped => tracee.resume(),
                _ => tracee.wait().map(|_| ()),
            };
            if let Err(lost) = step {
                if error.is_none() {
                    error = Some(lost);
                }
                break;
            }
            if tracee.state() == RunState::Running {
                if let Err(lost) = tracee.wait() {
                    if error.is_none() {
                        error = Some(lost);
                    }
                    break;
                }
            }
        }

        let disposition = tracee.disposition().unwrap_or(Disposition::Inconclusive);
        info!("trial end: {disposition}");
        Ok(InjectionResult {
            seed,
            fault,
            disposition,
            error,
        })
    }

    /// Snapshot, corrupt one bit, write back. Requires a stopped tracee.
    fn inject(&self, tracee: &TracedProcess, rng: &mut ChaCha8Rng) -> Result<FaultSpec, TrialError> {
        let snapshot = RegisterSnapshot::read_from(tracee)?;
        let spec = fault::choose_fault(rng, self.config.register_subset, REGISTER_WIDTH);
        let corrupted = fault::apply(&snapshot, &spec);
        corrupted.write_to(tracee)?;
        info!(
            "flipped {spec}: {:#018x} -> {:#018x}",
            snapshot.slot(spec.register),
            corrupted.slot(spec.register)
        );
        Ok(spec)
    }
}

/// Per-trial reseed, `time ^ pid` as the original campaigns use. Coarse
/// independence between rapid back-to-back trials is a known property the
/// campaign tooling relies on; do not strengthen silently.
pub(crate) fn reseed() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now ^ u64::from(std::process::id())
}
