pub mod action;
pub mod address;
pub mod error;
pub mod hex;
pub mod pad;

mod dispatch;
mod install;
mod registry;
mod run;
mod tracepoint;

pub use dispatch::{HitDirective, HitSource};
pub use registry::EntryId;
pub use run::{RunState, RunStatus, StopReason};
pub use tracepoint::{
    FastPatch, InstallHandle, InstallState, InstalledMechanism, Tracepoint, TracepointDef,
    TracepointKind, TracepointView,
};

use crate::tracer::action::{CompiledExpr, TraceFrame};
use crate::tracer::address::TargetAddress;
use crate::tracer::error::{Error, Fault};
use crate::tracer::install::Installer;
use crate::tracer::pad::JumpPadPool;
use crate::tracer::registry::{KindSupport, TracepointRegistry};
use crate::tracer::run::RunController;
use crate::{tp_info, weak_error};
use std::sync::Arc;

/// Execution context of the target thread that reached an instrumentation
/// point. Condition evaluation and actions only read through it; the
/// while-stepping phase drives it forward one instruction at a time.
pub trait TargetContext {
    fn read_register(&mut self, regno: u16) -> Result<u64, Fault>;
    fn read_memory(&mut self, address: TargetAddress, len: usize) -> Result<Vec<u8>, Fault>;
    fn single_step(&mut self) -> Result<(), Fault>;
}

/// Architecture-specific code patcher: knows how to write a jump or a
/// trap, how far a jump displaces original instructions, and how to fix up
/// position-dependent encodings when moving them.
pub trait CodePatcher: Send + Sync {
    /// Byte size of the jump instruction written by [`Self::write_jump`].
    fn jump_size(&self) -> usize;
    /// Length of whole instructions at `address` covering at least
    /// `min_len` bytes.
    fn instruction_length_at(&mut self, address: TargetAddress, min_len: usize)
        -> anyhow::Result<usize>;
    fn read_bytes(&mut self, address: TargetAddress, len: usize) -> anyhow::Result<Vec<u8>>;
    fn write_bytes(&mut self, address: TargetAddress, bytes: &[u8]) -> anyhow::Result<()>;
    fn write_jump(&mut self, address: TargetAddress, target: TargetAddress) -> anyhow::Result<()>;
    /// Write a trap at `address`, returning the displaced original bytes.
    fn write_trap(&mut self, address: TargetAddress) -> anyhow::Result<Vec<u8>>;
    fn restore_bytes(&mut self, address: TargetAddress, saved: &[u8]) -> anyhow::Result<()>;
    /// Copy instruction bytes from `from` to `to`, fixing up
    /// position-dependent encodings. The result may be longer than the
    /// input.
    fn relocate(
        &mut self,
        bytes: &[u8],
        from: TargetAddress,
        to: TargetAddress,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Evaluator for compiled agent expressions. Must be reentrant: hits on
/// different target threads evaluate concurrently.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &CompiledExpr, ctx: &mut dyn TargetContext) -> Result<u64, Fault>;

    /// Evaluate a tracepoint condition; a nonzero value means true.
    fn evaluate_condition(
        &self,
        expr: &CompiledExpr,
        ctx: &mut dyn TargetContext,
    ) -> Result<bool, Fault> {
        self.evaluate(expr, ctx).map(|value| value != 0)
    }
}

/// Hook/unhook of static tracing markers compiled into the target.
pub trait StaticProbe: Send + Sync {
    fn hook(&mut self, address: TargetAddress) -> anyhow::Result<()>;
    fn unhook(&mut self, address: TargetAddress) -> anyhow::Result<()>;
}

/// Destination of collected trace frames. Append-only and thread-safe:
/// frames arrive from whichever target thread took the hit.
pub trait TraceSink: Send + Sync {
    fn on_frame(&self, frame: TraceFrame);
}

/// Observer for per-hit faults and run lifecycle events.
pub trait TraceHook: Send + Sync {
    fn on_condition_fault(
        &self,
        number: u32,
        address: TargetAddress,
        fault: &Fault,
    ) -> anyhow::Result<()>;
    fn on_action_fault(
        &self,
        number: u32,
        address: TargetAddress,
        fault: &Fault,
    ) -> anyhow::Result<()>;
    fn on_step_fault(
        &self,
        number: u32,
        address: TargetAddress,
        fault: &Fault,
    ) -> anyhow::Result<()>;
    fn on_pass_exhausted(&self, number: u32, address: TargetAddress) -> anyhow::Result<()>;
    fn on_patch_corruption(&self, address: TargetAddress) -> anyhow::Result<()>;
    fn on_run_stop(&self, reason: &StopReason) -> anyhow::Result<()>;
}

/// The in-process tracepoint engine: tracepoint registry, fast-tracepoint
/// installer, hit dispatcher and run controller behind one facade.
///
/// Mutating operations (define/remove/install/start/stop) take `&mut
/// self`; hit dispatch takes `&self` and is safe to call concurrently
/// from multiple target threads. Exclusivity of `&mut self` is what
/// serializes patch mutation against in-flight hits at the same address.
pub struct TraceAgent {
    registry: TracepointRegistry,
    installer: Installer,
    run: RunController,
    patcher: Box<dyn CodePatcher>,
    evaluator: Box<dyn ExpressionEvaluator>,
    static_probe: Option<Box<dyn StaticProbe>>,
    sink: Box<dyn TraceSink>,
    hooks: Box<dyn TraceHook>,
}

pub struct TraceAgentBuilder {
    pad_pool: Option<JumpPadPool>,
    static_probe: Option<Box<dyn StaticProbe>>,
}

impl TraceAgentBuilder {
    pub fn new() -> Self {
        Self {
            pad_pool: None,
            static_probe: None,
        }
    }

    /// Reserve a target-side jump pad region, enabling fast tracepoints.
    pub fn with_jump_pad(mut self, base: TargetAddress, size: u64) -> Self {
        self.pad_pool = Some(JumpPadPool::new(base, size));
        self
    }

    /// Attach a static-marker hook collaborator, enabling static
    /// tracepoints.
    pub fn with_static_probe(mut self, probe: Box<dyn StaticProbe>) -> Self {
        self.static_probe = Some(probe);
        self
    }

    pub fn build(
        self,
        patcher: Box<dyn CodePatcher>,
        evaluator: Box<dyn ExpressionEvaluator>,
        sink: Box<dyn TraceSink>,
        hooks: Box<dyn TraceHook>,
    ) -> TraceAgent {
        let installer = Installer::new(self.pad_pool);
        let support = KindSupport {
            fast: installer.supports_fast(),
            r#static: self.static_probe.is_some(),
        };
        TraceAgent {
            registry: TracepointRegistry::new(support),
            installer,
            run: RunController::new(),
            patcher,
            evaluator,
            static_probe: self.static_probe,
            sink,
            hooks,
        }
    }
}

impl Default for TraceAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceAgent {
    pub fn builder() -> TraceAgentBuilder {
        TraceAgentBuilder::new()
    }

    /// Register a tracepoint from a decoded definition packet.
    ///
    /// The new entry is uninstalled with a zero hit count; it becomes live
    /// on [`Self::install_tracepoint`] or on run start.
    pub fn define_tracepoint(&mut self, def: TracepointDef) -> Result<EntryId, Error> {
        let id = self.registry.define(def)?;
        let tp = self.registry.get(id).expect("entry just defined");
        tp_info!(
            target: "tracer",
            "tracepoint {} ({}) defined at {}",
            tp.number(),
            tp.kind(),
            tp.address()
        );
        Ok(id)
    }

    /// Remove a tracepoint, uninstalling it first when live.
    ///
    /// Fails with [`Error::StillInstalled`] when the owning mechanism
    /// cannot take the patch out, leaving the entry unchanged. A corrupted
    /// patch is the exception: the entry is force-detached, reported, and
    /// removal proceeds.
    pub fn remove_tracepoint(&mut self, id: EntryId) -> Result<(), Error> {
        let tp = self
            .registry
            .get(id)
            .ok_or(Error::EntryNotFound(id))?
            .clone();

        if tp.is_installed() {
            match self.installer.uninstall(
                &tp,
                self.patcher.as_mut(),
                self.static_probe.as_deref_mut(),
            ) {
                Ok(()) => {}
                Err(Error::PatchCorruption(address)) => {
                    weak_error!(self
                        .hooks
                        .on_patch_corruption(address)
                        .map_err(Error::Hook));
                }
                Err(e) => {
                    weak_error!(Err::<(), Error>(e), "tracepoint uninstall:");
                    return Err(Error::StillInstalled(tp.number()));
                }
            }
        }
        self.registry.remove(id)?;
        Ok(())
    }

    /// Remove every tracepoint. Installed entries are uninstalled first;
    /// the first entry whose patch cannot be taken out aborts the clear.
    pub fn clear_tracepoints(&mut self) -> Result<(), Error> {
        let entries: Vec<Arc<Tracepoint>> = self.registry.list().cloned().collect();
        for tp in &entries {
            if !tp.is_installed() {
                continue;
            }
            match self.installer.uninstall(
                tp,
                self.patcher.as_mut(),
                self.static_probe.as_deref_mut(),
            ) {
                Ok(()) => {}
                Err(Error::PatchCorruption(address)) => {
                    weak_error!(self
                        .hooks
                        .on_patch_corruption(address)
                        .map_err(Error::Hook));
                }
                Err(e) => {
                    weak_error!(Err::<(), Error>(e), "tracepoint uninstall:");
                    return Err(Error::StillInstalled(tp.number()));
                }
            }
        }
        self.registry.clear_all()
    }

    /// Install a single entry through its owning mechanism.
    pub fn install_tracepoint(&mut self, id: EntryId) -> Result<(), Error> {
        let tp = self
            .registry
            .get(id)
            .ok_or(Error::EntryNotFound(id))?
            .clone();
        self.installer.install(
            &tp,
            self.patcher.as_mut(),
            self.static_probe.as_deref_mut(),
        )
    }

    /// Uninstall a single entry, leaving it defined.
    pub fn uninstall_tracepoint(&mut self, id: EntryId) -> Result<(), Error> {
        let tp = self
            .registry
            .get(id)
            .ok_or(Error::EntryNotFound(id))?
            .clone();
        self.installer.uninstall(
            &tp,
            self.patcher.as_mut(),
            self.static_probe.as_deref_mut(),
        )
    }

    /// Start a tracing run: every defined entry is installed, then the
    /// run goes active. A failed installation rolls everything back and
    /// leaves the run idle.
    pub fn start_run(&mut self) -> Result<(), Error> {
        self.run.start()?;

        let entries: Vec<Arc<Tracepoint>> = self.registry.list().cloned().collect();
        for tp in &entries {
            if let Err(e) = self.installer.install(
                tp,
                self.patcher.as_mut(),
                self.static_probe.as_deref_mut(),
            ) {
                for installed in &entries {
                    if installed.is_installed() {
                        weak_error!(
                            self.installer.uninstall(
                                installed,
                                self.patcher.as_mut(),
                                self.static_probe.as_deref_mut(),
                            ),
                            "run start rollback:"
                        );
                    }
                }
                self.run.abort_start();
                return Err(e);
            }
        }

        tp_info!(
            target: "tracer",
            "tracing run started, {} tracepoint(s) installed",
            entries.len()
        );
        Ok(())
    }

    /// Stop the run and tear it down: every installed entry is
    /// uninstalled, hit counts and source strings are retained for
    /// reporting. Also completes a stop already signalled by pass-count
    /// exhaustion.
    pub fn stop_run(&mut self) -> Result<(), Error> {
        match self.run.state() {
            RunState::Idle => return Err(Error::NotActive),
            RunState::Active => self.run.request_stop()?,
            RunState::Stopping => {}
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        let entries: Vec<Arc<Tracepoint>> = self.registry.list().cloned().collect();
        for tp in &entries {
            if !tp.is_installed() {
                continue;
            }
            match self.installer.uninstall(
                tp,
                self.patcher.as_mut(),
                self.static_probe.as_deref_mut(),
            ) {
                Ok(()) => {}
                Err(Error::PatchCorruption(address)) => {
                    weak_error!(self
                        .hooks
                        .on_patch_corruption(address)
                        .map_err(Error::Hook));
                }
                Err(e) => {
                    weak_error!(Err::<(), Error>(e), "run teardown:");
                }
            }
        }

        let reason = self.run.stop_reason().unwrap_or(StopReason::External);
        self.run.finish_teardown();
        tp_info!(target: "tracer", "tracing run stopped");
        weak_error!(self.hooks.on_run_stop(&reason).map_err(Error::Hook));
    }

    /// Flip the enabled flag on every entry matching number and address.
    /// A disabled tracepoint is skipped at dispatch but stays installed.
    pub fn enable_tracepoint(&mut self, number: u32, address: TargetAddress) -> Result<(), Error> {
        self.set_enabled(number, address, true)
    }

    pub fn disable_tracepoint(&mut self, number: u32, address: TargetAddress) -> Result<(), Error> {
        self.set_enabled(number, address, false)
    }

    fn set_enabled(
        &mut self,
        number: u32,
        address: TargetAddress,
        enabled: bool,
    ) -> Result<(), Error> {
        let matched: Vec<Arc<Tracepoint>> = self
            .registry
            .find_by_number(number)
            .into_iter()
            .filter(|tp| tp.address() == address)
            .collect();
        if matched.is_empty() {
            return Err(Error::TracepointNotFound(number, address));
        }
        for tp in matched {
            tp.set_enabled(enabled);
        }
        Ok(())
    }

    /// Status of every registered entry, in creation order, independent
    /// of whether a run is active.
    pub fn tracepoints(&self) -> Vec<TracepointView<'_>> {
        self.registry
            .list()
            .map(|tp| TracepointView::from(tp.as_ref()))
            .collect()
    }

    /// Entries sharing a debugger-assigned number.
    pub fn tracepoints_by_number(&self, number: u32) -> Vec<TracepointView<'_>> {
        self.registry
            .list()
            .filter(|tp| tp.number() == number)
            .map(|tp| TracepointView::from(tp.as_ref()))
            .collect()
    }

    pub fn run_status(&self) -> RunStatus {
        self.run.status()
    }
}
