//! Mock collaborators: a simulated target image with a toy fixed-width
//! ISA, a recording sink and a recording hook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracepad::tracer::action::{Action, CompiledExpr, TraceFrame};
use tracepad::tracer::address::TargetAddress;
use tracepad::tracer::error::Fault;
use tracepad::tracer::{
    CodePatcher, ExpressionEvaluator, StaticProbe, StopReason, TargetContext, TraceAgent,
    TraceHook, TraceSink, TracepointDef, TracepointKind,
};

/// Jump width of the mock ISA.
pub const JUMP_SIZE: usize = 5;
/// Every mock instruction is this wide.
pub const INSN_LEN: usize = 4;
/// Displacement of a jump at an instruction boundary: two instructions.
pub const ORIG_SIZE: usize = 8;

/// Simulated target memory. Unwritten bytes read as the low byte of their
/// address, so original code is deterministic without seeding.
#[derive(Default)]
pub struct TargetImage {
    written: HashMap<u64, u8>,
}

impl TargetImage {
    pub fn read(&self, addr: TargetAddress, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let a = addr.as_u64() + i;
                self.written.get(&a).copied().unwrap_or((a & 0xff) as u8)
            })
            .collect()
    }

    pub fn write(&mut self, addr: TargetAddress, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.written.insert(addr.as_u64() + i as u64, *b);
        }
    }

    /// True if the byte at `addr` was never patched (or was restored to
    /// its original value).
    pub fn is_pristine(&self, addr: TargetAddress, len: usize) -> bool {
        self.read(addr, len)
            .iter()
            .enumerate()
            .all(|(i, b)| *b == ((addr.as_u64() + i as u64) & 0xff) as u8)
    }
}

pub struct MockPatcher {
    pub image: Arc<Mutex<TargetImage>>,
    pub fail_restore: Arc<Mutex<bool>>,
}

impl MockPatcher {
    pub fn new(image: Arc<Mutex<TargetImage>>) -> Self {
        Self {
            image,
            fail_restore: Arc::new(Mutex::new(false)),
        }
    }
}

impl CodePatcher for MockPatcher {
    fn jump_size(&self) -> usize {
        JUMP_SIZE
    }

    fn instruction_length_at(
        &mut self,
        _address: TargetAddress,
        min_len: usize,
    ) -> anyhow::Result<usize> {
        Ok(min_len.div_ceil(INSN_LEN) * INSN_LEN)
    }

    fn read_bytes(&mut self, address: TargetAddress, len: usize) -> anyhow::Result<Vec<u8>> {
        Ok(self.image.lock().unwrap().read(address, len))
    }

    fn write_bytes(&mut self, address: TargetAddress, bytes: &[u8]) -> anyhow::Result<()> {
        self.image.lock().unwrap().write(address, bytes);
        Ok(())
    }

    fn write_jump(&mut self, address: TargetAddress, target: TargetAddress) -> anyhow::Result<()> {
        let mut encoded = vec![0xE9u8];
        encoded.extend_from_slice(&(target.as_u64() as u32).to_le_bytes());
        self.image.lock().unwrap().write(address, &encoded);
        Ok(())
    }

    fn write_trap(&mut self, address: TargetAddress) -> anyhow::Result<Vec<u8>> {
        let mut image = self.image.lock().unwrap();
        let saved = image.read(address, 1);
        image.write(address, &[0xCC]);
        Ok(saved)
    }

    fn restore_bytes(&mut self, address: TargetAddress, saved: &[u8]) -> anyhow::Result<()> {
        if *self.fail_restore.lock().unwrap() {
            anyhow::bail!("restore refused");
        }
        self.image.lock().unwrap().write(address, saved);
        Ok(())
    }

    fn relocate(
        &mut self,
        bytes: &[u8],
        _from: TargetAddress,
        _to: TargetAddress,
    ) -> anyhow::Result<Vec<u8>> {
        // the mock ISA has no position-dependent encodings
        Ok(bytes.to_vec())
    }
}

pub struct MockContext {
    pub regs: [u64; 16],
    pub image: Arc<Mutex<TargetImage>>,
    pub steps: usize,
    pub fail_steps: bool,
}

impl MockContext {
    pub fn new(image: Arc<Mutex<TargetImage>>) -> Self {
        let mut regs = [0u64; 16];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = 0x100 + i as u64;
        }
        Self {
            regs,
            image,
            steps: 0,
            fail_steps: false,
        }
    }
}

impl TargetContext for MockContext {
    fn read_register(&mut self, regno: u16) -> Result<u64, Fault> {
        self.regs
            .get(regno as usize)
            .copied()
            .ok_or_else(|| Fault::new(format!("no register {regno}")))
    }

    fn read_memory(&mut self, address: TargetAddress, len: usize) -> Result<Vec<u8>, Fault> {
        Ok(self.image.lock().unwrap().read(address, len))
    }

    fn single_step(&mut self) -> Result<(), Fault> {
        if self.fail_steps {
            return Err(Fault::new("step refused"));
        }
        self.steps += 1;
        Ok(())
    }
}

/// Interprets one-byte programs: `00` evaluates to 0, `01` to 1,
/// `10 <r>` to the value of register `r`, anything else faults.
pub struct MockEvaluator;

impl ExpressionEvaluator for MockEvaluator {
    fn evaluate(&self, expr: &CompiledExpr, ctx: &mut dyn TargetContext) -> Result<u64, Fault> {
        match expr.bytecode() {
            [0x00] => Ok(0),
            [0x01] => Ok(1),
            [0x10, regno] => ctx.read_register(*regno as u16),
            _ => Err(Fault::new("undefined opcode")),
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink(Arc<Mutex<Vec<TraceFrame>>>);

impl RecordingSink {
    pub fn frames(&self) -> Vec<TraceFrame> {
        self.0.lock().unwrap().clone()
    }
}

impl TraceSink for RecordingSink {
    fn on_frame(&self, frame: TraceFrame) {
        self.0.lock().unwrap().push(frame);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    ConditionFault(u32),
    ActionFault(u32),
    StepFault(u32),
    PassExhausted(u32),
    PatchCorruption(TargetAddress),
    RunStop(StopReason),
}

#[derive(Clone, Default)]
pub struct RecordingHook(Arc<Mutex<Vec<HookEvent>>>);

impl RecordingHook {
    pub fn events(&self) -> Vec<HookEvent> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, event: HookEvent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(event);
        Ok(())
    }
}

impl TraceHook for RecordingHook {
    fn on_condition_fault(
        &self,
        number: u32,
        _address: TargetAddress,
        _fault: &Fault,
    ) -> anyhow::Result<()> {
        self.push(HookEvent::ConditionFault(number))
    }

    fn on_action_fault(
        &self,
        number: u32,
        _address: TargetAddress,
        _fault: &Fault,
    ) -> anyhow::Result<()> {
        self.push(HookEvent::ActionFault(number))
    }

    fn on_step_fault(
        &self,
        number: u32,
        _address: TargetAddress,
        _fault: &Fault,
    ) -> anyhow::Result<()> {
        self.push(HookEvent::StepFault(number))
    }

    fn on_pass_exhausted(&self, number: u32, _address: TargetAddress) -> anyhow::Result<()> {
        self.push(HookEvent::PassExhausted(number))
    }

    fn on_patch_corruption(&self, address: TargetAddress) -> anyhow::Result<()> {
        self.push(HookEvent::PatchCorruption(address))
    }

    fn on_run_stop(&self, reason: &StopReason) -> anyhow::Result<()> {
        self.push(HookEvent::RunStop(reason.clone()))
    }
}

#[derive(Clone, Default)]
pub struct MockProbe(pub Arc<Mutex<Vec<TargetAddress>>>);

impl MockProbe {
    pub fn hooked(&self) -> Vec<TargetAddress> {
        self.0.lock().unwrap().clone()
    }
}

impl StaticProbe for MockProbe {
    fn hook(&mut self, address: TargetAddress) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(address);
        Ok(())
    }

    fn unhook(&mut self, address: TargetAddress) -> anyhow::Result<()> {
        self.0.lock().unwrap().retain(|a| *a != address);
        Ok(())
    }
}

pub struct Fixture {
    pub agent: TraceAgent,
    pub image: Arc<Mutex<TargetImage>>,
    pub sink: RecordingSink,
    pub hook: RecordingHook,
    pub fail_restore: Arc<Mutex<bool>>,
}

/// Agent over the mock target with a jump pad region at `pad_base` of
/// `pad_size` bytes.
pub fn fixture(pad_size: u64) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let image = Arc::new(Mutex::new(TargetImage::default()));
    let patcher = MockPatcher::new(image.clone());
    let fail_restore = patcher.fail_restore.clone();
    let sink = RecordingSink::default();
    let hook = RecordingHook::default();

    let agent = TraceAgent::builder()
        .with_jump_pad(TargetAddress::from(0x7000u64), pad_size)
        .build(
            Box::new(patcher),
            Box::new(MockEvaluator),
            Box::new(sink.clone()),
            Box::new(hook.clone()),
        );

    Fixture {
        agent,
        image,
        sink,
        hook,
        fail_restore,
    }
}

pub fn def(number: u32, address: u64, kind: TracepointKind) -> TracepointDef {
    TracepointDef {
        number,
        address: TargetAddress::from(address),
        kind,
        enabled: true,
        step_count: 0,
        pass_count: 0,
        condition: None,
        actions: vec![collect_r0()],
        step_actions: vec![],
        source_strings: vec![format!("{number}:{address:x}:{kind}")],
    }
}

/// Collect register 0 only.
pub fn collect_r0() -> Action {
    Action::Registers {
        mask: smallvec_mask(&[0b0000_0001]),
    }
}

pub fn smallvec_mask(bytes: &[u8]) -> smallvec::SmallVec<[u8; 8]> {
    bytes.iter().copied().collect()
}
