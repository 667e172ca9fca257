//! Register access layer for a stopped tracee.
//!
//! Reads and writes the complete general-purpose register set through
//! `PTRACE_GETREGSET` / `PTRACE_SETREGSET` (`NT_PRSTATUS`), one kernel call
//! per direction so a write is never partial. The kernel-side struct layout
//! is a private per-architecture detail; everything above this module only
//! sees [`RegisterSnapshot`].

use crate::controller::{RunState, TracedProcess};
use crate::error::TrialError;
use nix::errno::Errno;
use std::mem::{size_of, MaybeUninit};

/// Number of general-purpose registers in the snapshot.
#[cfg(target_arch = "aarch64")]
pub const GPR_COUNT: usize = 31;
#[cfg(target_arch = "x86_64")]
pub const GPR_COUNT: usize = 15;

/// Addressable register slots: the GPR file followed by sp and pc.
pub const REGISTER_FILE: usize = GPR_COUNT + 2;

/// Width of every addressable register, in bits.
pub const REGISTER_WIDTH: u32 = 64;

/// Slot index of the stack pointer.
pub const SP_SLOT: usize = GPR_COUNT;
/// Slot index of the program counter.
pub const PC_SLOT: usize = GPR_COUNT + 1;

/// Mirror of the kernel's `user_pt_regs` for AArch64.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RawRegs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

/// Mirror of the kernel's `user_regs_struct` for x86_64.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RawRegs {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbp: u64,
    rbx: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rax: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    orig_rax: u64,
    rip: u64,
    cs: u64,
    eflags: u64,
    rsp: u64,
    ss: u64,
    fs_base: u64,
    gs_base: u64,
    ds: u64,
    es: u64,
    fs: u64,
    gs: u64,
}

/// Value snapshot of a stopped tracee's architectural register state.
///
/// Immutable once captured as far as the live process is concerned; the fault
/// model clones and edits copies. Two reads without an intervening resume
/// compare equal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    raw: RawRegs,
}

/// GPR slot order on x86_64, caller-facing operand registers first so a
/// restricted subset (e.g. the first 8) biases toward recently used operands,
/// matching the x0..x7 restriction on AArch64.
#[cfg(target_arch = "x86_64")]
const X86_GPR_ORDER: [&str; GPR_COUNT] = [
    "rax", "rdi", "rsi", "rdx", "rcx", "r8", "r9", "r10", "r11", "rbx", "rbp", "r12", "r13", "r14",
    "r15",
];

impl RegisterSnapshot {
    /// All-zero snapshot, for tests and for replaying faults offline.
    pub fn zeroed() -> Self {
        Self::default()
    }

    /// Read the value of one addressable slot.
    ///
    /// Slots `0..GPR_COUNT` are the general-purpose file, followed by the
    /// stack pointer and the program counter. Panics on an out-of-range
    /// index; the fault model validates indices before calling.
    pub fn slot(&self, index: usize) -> u64 {
        match index {
            SP_SLOT => self.sp(),
            PC_SLOT => self.pc(),
            i if i < GPR_COUNT => self.gpr(i),
            _ => panic!("register slot {index} out of range (file size {REGISTER_FILE})"),
        }
    }

    /// Write one addressable slot. Same indexing as [`Self::slot`].
    pub fn set_slot(&mut self, index: usize, value: u64) {
        match index {
            SP_SLOT => self.set_sp(value),
            PC_SLOT => self.set_pc(value),
            i if i < GPR_COUNT => self.set_gpr(i, value),
            _ => panic!("register slot {index} out of range (file size {REGISTER_FILE})"),
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn gpr(&self, index: usize) -> u64 {
        self.raw.regs[index]
    }

    #[cfg(target_arch = "aarch64")]
    pub fn set_gpr(&mut self, index: usize, value: u64) {
        self.raw.regs[index] = value;
    }

    #[cfg(target_arch = "x86_64")]
    pub fn gpr(&self, index: usize) -> u64 {
        *self.x86_slot(index)
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_gpr(&mut self, index: usize, value: u64) {
        *self.x86_slot_mut(index) = value;
    }

    #[cfg(target_arch = "x86_64")]
    fn x86_slot(&self, index: usize) -> &u64 {
        let r = &self.raw;
        match index {
            0 => &r.rax,
            1 => &r.rdi,
            2 => &r.rsi,
            3 => &r.rdx,
            4 => &r.rcx,
            5 => &r.r8,
            6 => &r.r9,
            7 => &r.r10,
            8 => &r.r11,
            9 => &r.rbx,
            10 => &r.rbp,
            11 => &r.r12,
            12 => &r.r13,
            13 => &r.r14,
            14 => &r.r15,
            _ => panic!("gpr index {index} out of range"),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn x86_slot_mut(&mut self, index: usize) -> &mut u64 {
        let r = &mut self.raw;
        match index {
            0 => &mut r.rax,
            1 => &mut r.rdi,
            2 => &mut r.rsi,
            3 => &mut r.rdx,
            4 => &mut r.rcx,
            5 => &mut r.r8,
            6 => &mut r.r9,
            7 => &mut r.r10,
            8 => &mut r.r11,
            9 => &mut r.rbx,
            10 => &mut r.rbp,
            11 => &mut r.r12,
            12 => &mut r.r13,
            13 => &mut r.r14,
            14 => &mut r.r15,
            _ => panic!("gpr index {index} out of range"),
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn sp(&self) -> u64 {
        self.raw.sp
    }

    #[cfg(target_arch = "aarch64")]
    pub fn set_sp(&mut self, value: u64) {
        self.raw.sp = value;
    }

    #[cfg(target_arch = "aarch64")]
    pub fn pc(&self) -> u64 {
        self.raw.pc
    }

    #[cfg(target_arch = "aarch64")]
    pub fn set_pc(&mut self, value: u64) {
        self.raw.pc = value;
    }

    #[cfg(target_arch = "aarch64")]
    pub fn pstate(&self) -> u64 {
        self.raw.pstate
    }

    #[cfg(target_arch = "x86_64")]
    pub fn sp(&self) -> u64 {
        self.raw.rsp
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_sp(&mut self, value: u64) {
        self.raw.rsp = value;
    }

    #[cfg(target_arch = "x86_64")]
    pub fn pc(&self) -> u64 {
        self.raw.rip
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_pc(&mut self, value: u64) {
        self.raw.rip = value;
    }

    #[cfg(target_arch = "x86_64")]
    pub fn pstate(&self) -> u64 {
        self.raw.eflags
    }

    /// Snapshot the live register state of a stopped tracee.
    ///
    /// Every call goes to the kernel-held state, no caching. Fails with
    /// `AccessError` if the tracee is not stopped or already gone.
    pub fn read_from(tracee: &TracedProcess) -> Result<Self, TrialError> {
        require_stopped(tracee, "register read")?;
        let mut raw = MaybeUninit::<RawRegs>::uninit();
        let mut iov = libc::iovec {
            iov_base: raw.as_mut_ptr().cast(),
            iov_len: size_of::<RawRegs>(),
        };
        // One GETREGSET call fetches the whole NT_PRSTATUS set.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tracee.pid().as_raw(),
                libc::NT_PRSTATUS as libc::c_long,
                &mut iov as *mut libc::iovec,
            )
        };
        Errno::result(ret).map_err(|errno| TrialError::AccessError {
            op: "register read",
            state: tracee.state(),
            errno,
        })?;
        Ok(Self {
            raw: unsafe { raw.assume_init() },
        })
    }

    /// Write this snapshot back into a stopped tracee.
    ///
    /// The whole register set goes down in a single SETREGSET call; partial
    /// writes of NT_PRSTATUS are not meaningful.
    pub fn write_to(&self, tracee: &TracedProcess) -> Result<(), TrialError> {
        require_stopped(tracee, "register write")?;
        let mut iov = libc::iovec {
            iov_base: (&self.raw as *const RawRegs as *mut RawRegs).cast(),
            iov_len: size_of::<RawRegs>(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                tracee.pid().as_raw(),
                libc::NT_PRSTATUS as libc::c_long,
                &mut iov as *mut libc::iovec,
            )
        };
        Errno::result(ret).map_err(|errno| TrialError::AccessError {
            op: "register write",
            state: tracee.state(),
            errno,
        })?;
        Ok(())
    }
}

/// Human-readable name of an addressable slot.
#[cfg(target_arch = "aarch64")]
pub fn slot_name(index: usize) -> String {
    match index {
        SP_SLOT => "sp".to_string(),
        PC_SLOT => "pc".to_string(),
        i if i < GPR_COUNT => format!("x{i}"),
        _ => format!("slot{index}"),
    }
}

/// Human-readable name of an addressable slot.
#[cfg(target_arch = "x86_64")]
pub fn slot_name(index: usize) -> String {
    match index {
        SP_SLOT => "rsp".to_string(),
        PC_SLOT => "rip".to_string(),
        i if i < GPR_COUNT => X86_GPR_ORDER[i].to_string(),
        _ => format!("slot{index}"),
    }
}

/// Touching registers of a running or exited tracee is a programming error
/// and must fail loudly rather than corrupt unrelated state.
fn require_stopped(tracee: &TracedProcess, op: &'static str) -> Result<(), TrialError> {
    match tracee.state() {
        RunState::Stopped => Ok(()),
        state => Err(TrialError::AccessError {
            op,
            state,
            errno: Errno::ESRCH,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_roundtrip_covers_whole_file() {
        let mut snapshot = RegisterSnapshot::zeroed();
        for index in 0..REGISTER_FILE {
            snapshot.set_slot(index, 0x1000 + index as u64);
        }
        for index in 0..REGISTER_FILE {
            assert_eq!(snapshot.slot(index), 0x1000 + index as u64);
        }
    }

    #[test]
    fn sp_and_pc_are_addressable_slots() {
        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.set_slot(SP_SLOT, 0xdead);
        snapshot.set_slot(PC_SLOT, 0xbeef);
        assert_eq!(snapshot.sp(), 0xdead);
        assert_eq!(snapshot.pc(), 0xbeef);
        assert_eq!(snapshot.gpr(0), 0);
    }

    #[test]
    #[should_panic]
    fn out_of_range_slot_panics() {
        RegisterSnapshot::zeroed().slot(REGISTER_FILE);
    }
}
