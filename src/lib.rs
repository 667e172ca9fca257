mod checkpoint;
mod controller;
mod error;
mod fault;
mod registers;
mod trigger;

pub mod prelude {
    pub use crate::checkpoint::{BitPattern, FaultInjectorState};
    pub use crate::controller::{
        Controller, Disposition, InjectionResult, RunState, TracedProcess, TrialConfig,
    };
    pub use crate::error::TrialError;
    pub use crate::fault::{apply, choose_fault, FaultSpec};
    pub use crate::registers::{RegisterSnapshot, GPR_COUNT, REGISTER_FILE, REGISTER_WIDTH};
    pub use crate::trigger::{Trigger, TriggerConfig, TriggerOutcome, TriggerState};
}
