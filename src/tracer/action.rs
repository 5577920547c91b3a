use crate::tracer::address::TargetAddress;
use crate::tracer::error::Fault;
use crate::tracer::{ExpressionEvaluator, TargetContext};
use bytes::Bytes;
use smallvec::SmallVec;

/// Opaque handle to a compiled agent expression. The engine never looks
/// inside the bytecode, it only passes the handle to the expression
/// evaluator collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompiledExpr(Bytes);

impl CompiledExpr {
    pub fn new(bytecode: impl Into<Bytes>) -> Self {
        CompiledExpr(bytecode.into())
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.0
    }
}

/// A single data-collection operation executed when a tracepoint triggers.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Collect registers selected by a bitmask. The least significant bit
    /// of the first byte selects register number zero.
    Registers { mask: SmallVec<[u8; 8]> },
    /// Collect `length` bytes of memory at `basereg` + `offset`, or at the
    /// absolute address `offset` when `basereg` is absent.
    Memory {
        basereg: Option<u16>,
        offset: i64,
        length: u64,
    },
    /// Collect the value computed by an agent expression.
    Expression { expr: CompiledExpr },
}

impl Action {
    /// Execute this action against the target, appending collected values
    /// to `out`.
    pub(super) fn collect_into(
        &self,
        ctx: &mut dyn TargetContext,
        evaluator: &dyn ExpressionEvaluator,
        out: &mut Vec<CollectedValue>,
    ) -> Result<(), Fault> {
        match self {
            Action::Registers { mask } => {
                for (byte_idx, byte) in mask.iter().enumerate() {
                    for bit in 0..8 {
                        if byte & (1 << bit) == 0 {
                            continue;
                        }
                        let regno = (byte_idx * 8 + bit) as u16;
                        let value = ctx.read_register(regno)?;
                        out.push(CollectedValue::Register { regno, value });
                    }
                }
            }
            Action::Memory {
                basereg,
                offset,
                length,
            } => {
                let base = match basereg {
                    Some(regno) => ctx.read_register(*regno)?,
                    None => 0,
                };
                let address = TargetAddress::from(base.wrapping_add_signed(*offset));
                let data = ctx.read_memory(address, *length as usize)?;
                out.push(CollectedValue::Memory { address, data });
            }
            Action::Expression { expr } => {
                let value = evaluator.evaluate(expr, ctx)?;
                out.push(CollectedValue::Expression { value });
            }
        }
        Ok(())
    }
}

/// Ordered sequence of collection actions, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ActionList {
    actions: Box<[Action]>,
}

impl ActionList {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }
}

impl From<Vec<Action>> for ActionList {
    fn from(actions: Vec<Action>) -> Self {
        ActionList {
            actions: actions.into_boxed_slice(),
        }
    }
}

/// One datum captured by an action.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectedValue {
    Register { regno: u16, value: u64 },
    Memory { address: TargetAddress, data: Vec<u8> },
    Expression { value: u64 },
}

/// Data recorded for a single qualifying hit or a single stepping
/// iteration, appended to the trace sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    /// Number of the tracepoint that produced the frame.
    pub number: u32,
    /// Address of the instrumentation point.
    pub address: TargetAddress,
    pub values: Vec<CollectedValue>,
}
