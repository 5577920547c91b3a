use crate::tracer::action::{Action, ActionList, CompiledExpr};
use crate::tracer::address::{AddressRange, TargetAddress};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use strum_macros::{Display, EnumString};

/// Mechanism by which a tracepoint instruments the target. Fixed at
/// creation, never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TracepointKind {
    /// Trap instruction written at the address.
    Trap,
    /// Jump into a jump pad with relocated original instructions.
    Fast,
    /// Hook of a tracing-library call already compiled into the target.
    Static,
}

/// Opaque token identifying an installed trap, jump patch or static hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstallHandle(pub(super) u64);

/// Bookkeeping of a live fast-tracepoint patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastPatch {
    /// Bytes displaced at the address by the inserted jump.
    pub orig_size: usize,
    /// Jump pad span claimed for this site.
    pub jump_pad: AddressRange,
    /// Span inside the pad where the displaced instructions were moved to.
    pub relocated: AddressRange,
}

#[derive(Debug, Clone)]
pub enum InstalledMechanism {
    Trap(InstallHandle),
    Fast(InstallHandle, FastPatch),
    Static(InstallHandle),
}

impl InstalledMechanism {
    pub fn handle(&self) -> InstallHandle {
        match self {
            InstalledMechanism::Trap(h) => *h,
            InstalledMechanism::Fast(h, _) => *h,
            InstalledMechanism::Static(h) => *h,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum InstallState {
    #[default]
    Pending,
    Installed(InstalledMechanism),
}

/// Decoded tracepoint definition, as received from the wire-protocol layer.
#[derive(Debug, Clone)]
pub struct TracepointDef {
    pub number: u32,
    pub address: TargetAddress,
    pub kind: TracepointKind,
    pub enabled: bool,
    /// Single-step iterations to perform after each hit (0 = none).
    pub step_count: u64,
    /// Hit budget after which the whole run stops (0 = unlimited).
    pub pass_count: u64,
    pub condition: Option<CompiledExpr>,
    pub actions: Vec<Action>,
    pub step_actions: Vec<Action>,
    /// Verbatim definition text, kept for reporting back on reconnection.
    pub source_strings: Vec<String>,
}

/// Tracepoint representation.
#[derive(Debug)]
pub struct Tracepoint {
    /// Debugger-assigned number; multi-location tracepoints share it.
    number: u32,
    /// Instrumented address; stacked tracepoints share it.
    address: TargetAddress,
    kind: TracepointKind,
    enabled: AtomicBool,
    step_count: u64,
    pass_count: u64,
    /// Count of triggering hits. Stepping iterations are not hits.
    hit_count: AtomicU64,
    condition: Option<CompiledExpr>,
    actions: ActionList,
    step_actions: ActionList,
    install: Mutex<InstallState>,
    source_strings: Vec<String>,
}

impl Tracepoint {
    pub(super) fn new(def: TracepointDef) -> Self {
        Self {
            number: def.number,
            address: def.address,
            kind: def.kind,
            enabled: AtomicBool::new(def.enabled),
            step_count: def.step_count,
            pass_count: def.pass_count,
            hit_count: AtomicU64::new(0),
            condition: def.condition,
            actions: def.actions.into(),
            step_actions: def.step_actions.into(),
            install: Mutex::new(InstallState::Pending),
            source_strings: def.source_strings,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn address(&self) -> TargetAddress {
        self.address
    }

    pub fn kind(&self) -> TracepointKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(super) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed)
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn pass_count(&self) -> u64 {
        self.pass_count
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Register one qualifying hit, return the new count. Concurrent hits
    /// on the same entry each observe a distinct count value.
    pub(super) fn register_hit(&self) -> u64 {
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn condition(&self) -> Option<&CompiledExpr> {
        self.condition.as_ref()
    }

    pub fn actions(&self) -> &ActionList {
        &self.actions
    }

    pub fn step_actions(&self) -> &ActionList {
        &self.step_actions
    }

    pub fn source_strings(&self) -> &[String] {
        &self.source_strings
    }

    pub fn is_installed(&self) -> bool {
        matches!(
            *self.install.lock().expect("install state lock poisoned"),
            InstallState::Installed(_)
        )
    }

    pub fn install_handle(&self) -> Option<InstallHandle> {
        self.installed_mechanism().map(|m| m.handle())
    }

    pub fn installed_mechanism(&self) -> Option<InstalledMechanism> {
        match &*self.install.lock().expect("install state lock poisoned") {
            InstallState::Pending => None,
            InstallState::Installed(mech) => Some(mech.clone()),
        }
    }

    /// Jump pad bookkeeping, present only on installed fast entries.
    pub fn fast_patch(&self) -> Option<FastPatch> {
        match self.installed_mechanism() {
            Some(InstalledMechanism::Fast(_, patch)) => Some(patch),
            _ => None,
        }
    }

    pub(super) fn set_installed(&self, mech: InstalledMechanism) {
        let mut state = self.install.lock().expect("install state lock poisoned");
        debug_assert!(matches!(*state, InstallState::Pending));
        *state = InstallState::Installed(mech);
    }

    pub(super) fn clear_installed(&self) -> Option<InstalledMechanism> {
        let mut state = self.install.lock().expect("install state lock poisoned");
        match std::mem::take(&mut *state) {
            InstallState::Pending => None,
            InstallState::Installed(mech) => Some(mech),
        }
    }
}

/// Tracepoint information struct, reported back to the controlling
/// debugger independent of whether a run is active.
#[derive(Debug, Clone, PartialEq)]
pub struct TracepointView<'a> {
    pub number: u32,
    pub address: TargetAddress,
    pub kind: TracepointKind,
    pub enabled: bool,
    pub hit_count: u64,
    pub pass_count: u64,
    pub source_strings: &'a [String],
}

impl<'a> From<&'a Tracepoint> for TracepointView<'a> {
    fn from(tp: &'a Tracepoint) -> Self {
        Self {
            number: tp.number,
            address: tp.address,
            kind: tp.kind,
            enabled: tp.is_enabled(),
            hit_count: tp.hit_count(),
            pass_count: tp.pass_count,
            source_strings: &tp.source_strings,
        }
    }
}
