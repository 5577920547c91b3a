use crate::tracer::action::{ActionList, TraceFrame};
use crate::tracer::address::TargetAddress;
use crate::tracer::error::Error;
use crate::tracer::run::{RunState, StopReason};
use crate::tracer::tracepoint::{Tracepoint, TracepointKind};
use crate::tracer::{TargetContext, TraceAgent};
use crate::{tp_debug, weak_error};

/// Mechanism through which control reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// Trap instruction at the stopped address.
    Trap,
    /// Jump-pad collection code of a fast tracepoint.
    JumpPad,
    /// Call site of a hooked static tracing marker.
    StaticMarker,
}

impl HitSource {
    fn serves(self, kind: TracepointKind) -> bool {
        matches!(
            (self, kind),
            (HitSource::Trap, TracepointKind::Trap)
                | (HitSource::JumpPad, TracepointKind::Fast)
                | (HitSource::StaticMarker, TracepointKind::Static)
        )
    }
}

/// Directive returned to the execution engine after a hit is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitDirective {
    /// Resume free execution.
    Continue,
    /// The run is over; the execution engine must initiate teardown.
    StopRun(StopReason),
}

impl TraceAgent {
    /// Dispatch one hit.
    ///
    /// Invoked synchronously on the target thread that reached the
    /// instrumentation point, with that thread's execution context.
    /// Fans out to every enabled entry stacked at `address` and served by
    /// `source`, in creation order: each entry runs its condition, its
    /// actions and its while-stepping phase independently.
    pub fn handle_hit(
        &self,
        source: HitSource,
        address: TargetAddress,
        ctx: &mut dyn TargetContext,
    ) -> HitDirective {
        match self.run.state() {
            RunState::Idle => return HitDirective::Continue,
            RunState::Stopping => return self.stop_directive(),
            RunState::Active => {}
        }

        for tp in self
            .registry
            .find_by_address(address)
            .iter()
            .filter(|tp| source.serves(tp.kind()) && tp.is_installed() && tp.is_enabled())
        {
            self.process_entry(tp, address, ctx);
        }

        if self.run.is_stopping() {
            self.stop_directive()
        } else {
            HitDirective::Continue
        }
    }

    fn stop_directive(&self) -> HitDirective {
        HitDirective::StopRun(self.run.stop_reason().unwrap_or(StopReason::External))
    }

    fn process_entry(&self, tp: &Tracepoint, address: TargetAddress, ctx: &mut dyn TargetContext) {
        if let Some(cond) = tp.condition() {
            match self.evaluator.evaluate_condition(cond, ctx) {
                Ok(true) => {}
                Ok(false) => return,
                Err(fault) => {
                    // a faulting condition reads as false: no counters advance
                    tp_debug!(
                        target: "tracer",
                        "condition fault on tracepoint {} at {address}: {fault}",
                        tp.number()
                    );
                    weak_error!(self
                        .hooks
                        .on_condition_fault(tp.number(), address, &fault)
                        .map_err(Error::Hook));
                    return;
                }
            }
        }

        let hits = tp.register_hit();
        self.run_actions(tp, tp.actions(), address, ctx);

        if tp.pass_count() != 0 && hits == tp.pass_count() {
            // the atomic counter hands the threshold value to exactly one hit
            self.run.notify_pass_exhausted(tp.number(), address);
            weak_error!(self
                .hooks
                .on_pass_exhausted(tp.number(), address)
                .map_err(Error::Hook));
        }

        if tp.step_count() > 0 {
            self.stepping_phase(tp, address, ctx);
        }
    }

    /// Execute an action list against the target and append the resulting
    /// frame to the sink. A failing action is reported and the remaining
    /// actions still run.
    fn run_actions(
        &self,
        tp: &Tracepoint,
        actions: &ActionList,
        address: TargetAddress,
        ctx: &mut dyn TargetContext,
    ) {
        let mut values = Vec::new();
        for action in actions.iter() {
            if let Err(fault) = action.collect_into(ctx, self.evaluator.as_ref(), &mut values) {
                weak_error!(self
                    .hooks
                    .on_action_fault(tp.number(), address, &fault)
                    .map_err(Error::Hook));
            }
        }
        self.sink.on_frame(TraceFrame {
            number: tp.number(),
            address,
            values,
        });
    }

    /// While-stepping: one `step_actions` execution per single-step, for
    /// `step_count` consecutive steps. Interruptible only by the run
    /// controller's stop signal.
    fn stepping_phase(&self, tp: &Tracepoint, address: TargetAddress, ctx: &mut dyn TargetContext) {
        for _ in 0..tp.step_count() {
            if self.run.is_stopping() {
                break;
            }
            if let Err(fault) = ctx.single_step() {
                weak_error!(self
                    .hooks
                    .on_step_fault(tp.number(), address, &fault)
                    .map_err(Error::Hook));
                break;
            }
            self.run_actions(tp, tp.step_actions(), address, ctx);
        }
    }
}
