//! The reference machine.

use log::trace;

use crate::{
    engine::{
        EngineByte, EngineFault, EngineTrace, EngineWrite, ExecutionEngine, ExecutionRequest,
        ExecutionStats, MemoryRegion,
    },
    expr::{ExprArena, ExprId, SymbolicOp},
    sim::program::{Instruction, Program, Reg},
};

/// A register value: the concrete value the target really computes, plus the
/// expression describing it when it depends on symbolic state.
#[derive(Debug, Clone, Copy, Default)]
struct Value {
    concrete: u64,
    symbolic: Option<ExprId>,
}

impl Value {
    fn concrete(value: u64) -> Self {
        Self {
            concrete: value,
            symbolic: None,
        }
    }

    fn expr(&self, arena: &mut ExprArena) -> ExprId {
        match self.symbolic {
            Some(id) => id,
            None => arena.constant(self.concrete),
        }
    }
}

struct Run<'a> {
    request: &'a ExecutionRequest<'a>,
    regs: [Value; Reg::COUNT],
    arena: ExprArena,
    writes: Vec<EngineWrite>,
    stats: ExecutionStats,
    counter_draws: u64,
}

impl Run<'_> {
    fn symbolic(&self) -> bool {
        !self.request.symbolic_regions.is_empty()
    }

    fn crash(&self, reason: impl Into<String>) -> EngineFault {
        EngineFault::Crash {
            step: self.stats.steps_executed,
            reason: reason.into(),
        }
    }

    fn reg(&self, reg: Reg) -> Value {
        self.regs[reg.index()]
    }

    fn set(&mut self, reg: Reg, value: Value) {
        self.regs[reg.index()] = value;
    }

    /// Drops expressions that folded to constants.
    fn make(&self, concrete: u64, expr: ExprId) -> Value {
        Value {
            concrete,
            symbolic: self.arena.as_const(expr).is_none().then_some(expr),
        }
    }

    fn concrete_operand(&self, reg: Reg, what: &str) -> Result<u64, EngineFault> {
        let value = self.reg(reg);
        if value.symbolic.is_some() {
            return Err(self.crash(format!("symbolic {what} in {reg}")));
        }
        Ok(value.concrete)
    }

    fn input_byte(&self, index: u64) -> Value {
        let byte = usize::try_from(index)
            .ok()
            .and_then(|index| self.request.input.get(index))
            .copied()
            .unwrap_or(0);
        Value::concrete(u64::from(byte))
    }

    fn unary(&mut self, op: SymbolicOp, src: Value) -> Value {
        let concrete = op.apply_unary(src.concrete);
        match src.symbolic {
            Some(operand) => {
                let expr = self.arena.unary(op, operand);
                self.make(concrete, expr)
            }
            None => Value::concrete(concrete),
        }
    }

    fn binary(&mut self, op: SymbolicOp, lhs: Value, rhs: Value) -> Value {
        let concrete = op.apply_binary(lhs.concrete, rhs.concrete);
        if lhs.symbolic.is_none() && rhs.symbolic.is_none() {
            return Value::concrete(concrete);
        }
        let l = lhs.expr(&mut self.arena);
        let r = rhs.expr(&mut self.arena);
        let expr = self.arena.binary(op, l, r);
        self.make(concrete, expr)
    }

    fn emit(&mut self, channel: crate::engine::ChannelId, bytes: Vec<EngineByte>) {
        self.writes.push(EngineWrite {
            channel,
            step: self.stats.steps_executed,
            bytes,
        });
    }
}

/// A sixteen-register machine running one [`Program`] against a mapped flag page.
///
/// The machine tracks every register twice: the value the target actually computes
/// from the real flag content, and, in symbolic runs, the expression that value
/// has over the flag bytes. Branches always follow the real value, so a symbolic run
/// takes the same path as a concrete run with the same input and seed.
///
/// # Memory
///
/// The flag page is mapped at its base address; every other address reads as zero.
/// Loads through a symbolic address crash the target.
///
/// # Runtime counter
///
/// The `n`-th [`Instruction::Counter`] of a run yields the low byte of `seed + n`. In
/// symbolic runs the byte is additionally described by a fresh external variable,
/// which marks every output derived from it as dependent on runtime state.
/// [`SimMachine::with_untracked_counter`] turns that off to model engines that do not
/// see such state.
///
/// # Example
///
/// ```rust
/// use leakscope::config::ExecutionLimits;
/// use leakscope::engine::{ChannelId, EngineByte, ExecutionEngine, ExecutionRequest};
/// use leakscope::sim::{ProgramAssembler, Reg, SimMachine};
///
/// let mut asm = ProgramAssembler::new();
/// asm.imm(Reg(1), 0)
///     .load(Reg(0), 0x1000, Reg(1))
///     .emit(ChannelId::STDOUT, Reg(0))
///     .halt();
/// let machine = SimMachine::new(asm.finish()?, 0x1000, b"FLAG".to_vec());
///
/// let trace = machine
///     .execute(&ExecutionRequest {
///         input: &[],
///         symbolic_regions: &[],
///         seed: 0,
///         limits: ExecutionLimits::default(),
///     })
///     .unwrap();
/// assert_eq!(trace.writes[0].bytes, vec![EngineByte::Concrete(b'F')]);
/// # Ok::<(), leakscope::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct SimMachine {
    program: Program,
    flag: MemoryRegion,
    flag_content: Vec<u8>,
    track_counter: bool,
}

impl SimMachine {
    /// Creates a machine with `flag_content` mapped at `flag_base`.
    #[must_use]
    pub fn new(program: Program, flag_base: u64, flag_content: Vec<u8>) -> Self {
        let len = u32::try_from(flag_content.len()).unwrap_or(u32::MAX);
        Self {
            program,
            flag: MemoryRegion {
                base: flag_base,
                len,
            },
            flag_content,
            track_counter: true,
        }
    }

    /// Keeps the runtime counter concrete in symbolic runs.
    #[must_use]
    pub fn with_untracked_counter(mut self) -> Self {
        self.track_counter = false;
        self
    }

    /// The program this machine runs.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The mapped flag page.
    #[must_use]
    pub fn flag_region(&self) -> MemoryRegion {
        self.flag
    }

    fn load(&self, run: &mut Run<'_>, address: u64) -> Value {
        for region in run.request.symbolic_regions {
            if let Some(offset) = region.offset_of(address) {
                let concrete = self.read_concrete(address);
                let expr = run.arena.flag_byte(offset);
                return Value {
                    concrete,
                    symbolic: Some(expr),
                };
            }
        }
        Value::concrete(self.read_concrete(address))
    }

    fn read_concrete(&self, address: u64) -> u64 {
        self.flag
            .offset_of(address)
            .and_then(|offset| self.flag_content.get(offset as usize))
            .map_or(0, |byte| u64::from(*byte))
    }

    fn counter(&self, run: &mut Run<'_>) -> Value {
        let draw = run.counter_draws;
        run.counter_draws += 1;
        let concrete = run.request.seed.wrapping_add(draw) & 0xff;
        if run.symbolic() && self.track_counter {
            let expr = run.arena.external(format!("counter{draw}"));
            Value {
                concrete,
                symbolic: Some(expr),
            }
        } else {
            Value::concrete(concrete)
        }
    }

    fn step(&self, run: &mut Run<'_>, pc: usize) -> Result<Option<usize>, EngineFault> {
        let Some(instruction) = self.program.instructions().get(pc) else {
            return Ok(None);
        };

        let next = Some(pc + 1);
        match instruction {
            Instruction::LoadInput { dst, index } => {
                let value = run.input_byte(u64::from(*index));
                run.set(*dst, value);
            }
            Instruction::LoadInputReg { dst, index } => {
                let index = run.concrete_operand(*index, "input index")?;
                let value = run.input_byte(index);
                run.set(*dst, value);
            }
            Instruction::Load { dst, base, offset } => {
                let offset = run.concrete_operand(*offset, "address")?;
                let value = self.load(run, base.wrapping_add(offset));
                run.set(*dst, value);
            }
            Instruction::Imm { dst, value } => run.set(*dst, Value::concrete(*value)),
            Instruction::Mov { dst, src } => {
                let value = run.reg(*src);
                run.set(*dst, value);
            }
            Instruction::Unary { op, dst, src } => {
                let value = run.unary(*op, run.reg(*src));
                run.set(*dst, value);
            }
            Instruction::Binary { op, dst, lhs, rhs } => {
                let value = run.binary(*op, run.reg(*lhs), run.reg(*rhs));
                run.set(*dst, value);
            }
            Instruction::BinaryImm { op, dst, lhs, imm } => {
                let value = run.binary(*op, run.reg(*lhs), Value::concrete(*imm));
                run.set(*dst, value);
            }
            Instruction::Select {
                dst,
                cond,
                then,
                otherwise,
            } => {
                let (c, t, o) = (run.reg(*cond), run.reg(*then), run.reg(*otherwise));
                let concrete = if c.concrete != 0 {
                    t.concrete
                } else {
                    o.concrete
                };
                let value = if c.symbolic.is_none() {
                    if c.concrete != 0 {
                        t
                    } else {
                        o
                    }
                } else {
                    let ce = c.expr(&mut run.arena);
                    let te = t.expr(&mut run.arena);
                    let oe = o.expr(&mut run.arena);
                    let expr = run.arena.select(ce, te, oe);
                    run.make(concrete, expr)
                };
                run.set(*dst, value);
            }
            Instruction::Counter { dst } => {
                let value = self.counter(run);
                run.set(*dst, value);
            }
            Instruction::Emit { channel, src } => {
                let value = run.reg(*src);
                let byte = match value.symbolic {
                    Some(expr) => EngineByte::Symbolic(expr),
                    None => EngineByte::Concrete(value.concrete as u8),
                };
                run.emit(*channel, vec![byte]);
            }
            Instruction::EmitBytes { channel, bytes } => {
                let bytes = bytes.iter().copied().map(EngineByte::Concrete).collect();
                run.emit(*channel, bytes);
            }
            Instruction::Jump { target } => return Ok(Some(*target)),
            Instruction::BranchIf { cond, target } => {
                if run.reg(*cond).concrete != 0 {
                    return Ok(Some(*target));
                }
            }
            Instruction::Halt => return Ok(None),
            Instruction::Fault { reason } => return Err(run.crash(reason.clone())),
        }
        Ok(next)
    }
}

impl ExecutionEngine for SimMachine {
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<EngineTrace, EngineFault> {
        let mut run = Run {
            request,
            regs: [Value::default(); Reg::COUNT],
            arena: ExprArena::new(),
            writes: Vec::new(),
            stats: ExecutionStats::new(),
            counter_draws: 0,
        };
        run.stats.start();

        let mut pc = 0usize;
        loop {
            if let Some(exceeded) = run.stats.check_limits(&request.limits) {
                return Err(EngineFault::LimitExceeded(exceeded));
            }
            let next = self.step(&mut run, pc)?;
            run.stats.increment_steps();
            match next {
                Some(target) => pc = target,
                None => break,
            }
        }

        trace!(
            "sim run finished after {} steps with {} writes ({} symbolic nodes)",
            run.stats.steps_executed,
            run.writes.len(),
            run.arena.len()
        );

        Ok(EngineTrace {
            writes: run.writes,
            arena: run.arena,
            steps: run.stats.steps_executed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ExecutionLimits,
        engine::{ChannelId, LimitExceeded},
        expr::Variable,
        sim::program::ProgramAssembler,
    };

    const BASE: u64 = 0x4347_c000;

    fn request<'a>(input: &'a [u8], regions: &'a [MemoryRegion], seed: u64) -> ExecutionRequest<'a> {
        ExecutionRequest {
            input,
            symbolic_regions: regions,
            seed,
            limits: ExecutionLimits::new().with_max_steps(10_000),
        }
    }

    fn xor_leak() -> SimMachine {
        let mut asm = ProgramAssembler::new();
        asm.load_input(Reg(1), 0)
            .load(Reg(0), BASE, Reg(1))
            .xor_imm(Reg(0), Reg(0), 0x42)
            .emit(ChannelId::STDOUT, Reg(0))
            .halt();
        SimMachine::new(asm.finish().unwrap(), BASE, vec![0x10, 0x20, 0x30])
    }

    #[test]
    fn test_concrete_run() {
        let machine = xor_leak();
        let trace = machine.execute(&request(&[1], &[], 0)).unwrap();
        assert_eq!(trace.writes.len(), 1);
        assert_eq!(trace.writes[0].bytes, vec![EngineByte::Concrete(0x20 ^ 0x42)]);
        assert_eq!(trace.steps, 5);
        assert!(trace.arena.is_empty());
    }

    #[test]
    fn test_symbolic_run() {
        let machine = xor_leak();
        let region = machine.flag_region();
        let trace = machine.execute(&request(&[2], &[region], 0)).unwrap();
        let EngineByte::Symbolic(expr) = trace.writes[0].bytes[0] else {
            panic!("expected a symbolic byte");
        };
        assert_eq!(
            trace.arena.free_variables(expr).into_iter().collect::<Vec<_>>(),
            vec![Variable::Flag(2)]
        );
        assert_eq!(trace.arena.evaluate(expr, |_| Some(0x30)), Some(0x72));
    }

    #[test]
    fn test_unmapped_reads_zero() {
        let mut asm = ProgramAssembler::new();
        asm.imm(Reg(1), 0).load(Reg(0), 0x10, Reg(1)).emit(ChannelId::STDOUT, Reg(0));
        let machine = SimMachine::new(asm.finish().unwrap(), BASE, vec![1]);
        let trace = machine.execute(&request(&[], &[], 0)).unwrap();
        assert_eq!(trace.writes[0].bytes, vec![EngineByte::Concrete(0)]);
    }

    #[test]
    fn test_symbolic_address_crashes() {
        let mut asm = ProgramAssembler::new();
        asm.imm(Reg(1), 0)
            .load(Reg(0), BASE, Reg(1))
            .load(Reg(2), BASE, Reg(0))
            .halt();
        let machine = SimMachine::new(asm.finish().unwrap(), BASE, vec![0]);
        let region = machine.flag_region();
        let fault = machine.execute(&request(&[], &[region], 0)).unwrap_err();
        assert!(matches!(fault, EngineFault::Crash { step: 2, .. }));
    }

    #[test]
    fn test_branch_follows_real_flag() {
        let mut asm = ProgramAssembler::new();
        asm.imm(Reg(1), 0)
            .load(Reg(0), BASE, Reg(1))
            .branch_if(Reg(0), "nonzero")
            .emit_bytes(ChannelId::STDOUT, b"zero")
            .halt();
        asm.label("nonzero")
            .unwrap()
            .emit_bytes(ChannelId::STDOUT, b"set")
            .halt();
        let machine = SimMachine::new(asm.finish().unwrap(), BASE, vec![7]);
        let region = machine.flag_region();
        let trace = machine.execute(&request(&[], &[region], 0)).unwrap();
        assert_eq!(trace.writes[0].bytes.len(), 3);
    }

    #[test]
    fn test_counter_is_seeded() {
        let mut asm = ProgramAssembler::new();
        asm.counter(Reg(0)).emit(ChannelId::STDOUT, Reg(0));
        let machine = SimMachine::new(asm.finish().unwrap(), BASE, vec![0]);

        let a = machine.execute(&request(&[], &[], 1)).unwrap();
        let b = machine.execute(&request(&[], &[], 1)).unwrap();
        assert_eq!(a.writes, b.writes);

        let region = machine.flag_region();
        let symbolic = machine.execute(&request(&[], &[region], 1)).unwrap();
        let EngineByte::Symbolic(expr) = symbolic.writes[0].bytes[0] else {
            panic!("expected a symbolic byte");
        };
        assert!(symbolic
            .arena
            .free_variables(expr)
            .iter()
            .all(|v| !v.is_flag()));
    }

    #[test]
    fn test_step_limit() {
        let mut asm = ProgramAssembler::new();
        asm.label("spin").unwrap().jump("spin");
        let machine = SimMachine::new(asm.finish().unwrap(), BASE, vec![0]);
        let fault = machine.execute(&request(&[], &[], 0)).unwrap_err();
        assert_eq!(
            fault,
            EngineFault::LimitExceeded(LimitExceeded::Steps {
                executed: 10_000,
                limit: 10_000
            })
        );
    }

    #[test]
    fn test_fault_instruction() {
        let mut asm = ProgramAssembler::new();
        asm.fault("abort");
        let machine = SimMachine::new(asm.finish().unwrap(), BASE, vec![0]);
        let fault = machine.execute(&request(&[], &[], 0)).unwrap_err();
        assert_eq!(
            fault,
            EngineFault::Crash {
                step: 0,
                reason: "abort".to_string()
            }
        );
    }
}
