//! Instruction set and assembler of the reference machine.

use std::{collections::HashMap, fmt};

use crate::{engine::ChannelId, expr::SymbolicOp, Error, Result};

/// A machine register, `r0` to `r15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    /// Number of registers of the machine.
    pub const COUNT: usize = 16;

    /// Returns the register index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `dst = input[index]`, zero past the end of the input.
    LoadInput {
        /// Destination register.
        dst: Reg,
        /// Input position.
        index: u32,
    },
    /// `dst = input[index_reg]`, zero past the end of the input.
    LoadInputReg {
        /// Destination register.
        dst: Reg,
        /// Register holding the input position; must be concrete.
        index: Reg,
    },
    /// `dst = memory[base + offset]` (one byte); must be a concrete address.
    Load {
        /// Destination register.
        dst: Reg,
        /// Base address.
        base: u64,
        /// Register holding the offset from `base`.
        offset: Reg,
    },
    /// `dst = value`
    Imm {
        /// Destination register.
        dst: Reg,
        /// Immediate value.
        value: u64,
    },
    /// `dst = src`
    Mov {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// `dst = op src`
    Unary {
        /// Unary operation.
        op: SymbolicOp,
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// `dst = lhs op rhs`
    Binary {
        /// Binary operation.
        op: SymbolicOp,
        /// Destination register.
        dst: Reg,
        /// Left operand register.
        lhs: Reg,
        /// Right operand register.
        rhs: Reg,
    },
    /// `dst = lhs op imm`
    BinaryImm {
        /// Binary operation.
        op: SymbolicOp,
        /// Destination register.
        dst: Reg,
        /// Left operand register.
        lhs: Reg,
        /// Right operand.
        imm: u64,
    },
    /// `dst = cond != 0 ? then : otherwise`
    Select {
        /// Destination register.
        dst: Reg,
        /// Condition register.
        cond: Reg,
        /// Register chosen when the condition holds.
        then: Reg,
        /// Register chosen otherwise.
        otherwise: Reg,
    },
    /// `dst = next runtime counter byte`
    Counter {
        /// Destination register.
        dst: Reg,
    },
    /// Writes the low byte of `src` to `channel`.
    Emit {
        /// Output channel.
        channel: ChannelId,
        /// Source register.
        src: Reg,
    },
    /// Writes literal bytes to `channel`.
    EmitBytes {
        /// Output channel.
        channel: ChannelId,
        /// The bytes.
        bytes: Vec<u8>,
    },
    /// Continues at `target`.
    Jump {
        /// Instruction index.
        target: usize,
    },
    /// Continues at `target` if `cond` is non-zero.
    BranchIf {
        /// Condition register.
        cond: Reg,
        /// Instruction index.
        target: usize,
    },
    /// Stops execution normally.
    Halt,
    /// Stops execution with a crash.
    Fault {
        /// Crash description.
        reason: String,
    },
}

/// An assembled, label-free program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    /// Wraps already resolved instructions.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// The instructions, indexed by branch targets.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` for the empty program, which halts immediately.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Builds [`Program`]s with symbolic branch labels.
///
/// Branches may reference labels defined later; [`ProgramAssembler::finish`] resolves
/// them.
///
/// # Examples
///
/// ```rust
/// use leakscope::engine::ChannelId;
/// use leakscope::sim::{ProgramAssembler, Reg};
///
/// let mut asm = ProgramAssembler::new();
/// asm.imm(Reg(0), 3)
///     .label("loop")?
///     .emit(ChannelId::STDOUT, Reg(0))
///     .sub_imm(Reg(0), Reg(0), 1)
///     .branch_if(Reg(0), "loop")
///     .halt();
/// let program = asm.finish()?;
/// assert_eq!(program.len(), 5);
/// # Ok::<(), leakscope::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct ProgramAssembler {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
}

impl ProgramAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw instruction.
    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Defines `name` at the current position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the label is already defined.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        if self.labels.contains_key(name) {
            return Err(invalid_input!("duplicate label '{}'", name));
        }
        self.labels.insert(name.to_string(), self.instructions.len());
        Ok(self)
    }

    /// `dst = input[index]`
    pub fn load_input(&mut self, dst: Reg, index: u32) -> &mut Self {
        self.push(Instruction::LoadInput { dst, index })
    }

    /// `dst = input[index]` with the position taken from a register.
    pub fn load_input_reg(&mut self, dst: Reg, index: Reg) -> &mut Self {
        self.push(Instruction::LoadInputReg { dst, index })
    }

    /// `dst = memory[base + offset]`
    pub fn load(&mut self, dst: Reg, base: u64, offset: Reg) -> &mut Self {
        self.push(Instruction::Load { dst, base, offset })
    }

    /// `dst = value`
    pub fn imm(&mut self, dst: Reg, value: u64) -> &mut Self {
        self.push(Instruction::Imm { dst, value })
    }

    /// `dst = src`
    pub fn mov(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.push(Instruction::Mov { dst, src })
    }

    /// `dst = op src`
    pub fn unary(&mut self, op: SymbolicOp, dst: Reg, src: Reg) -> &mut Self {
        self.push(Instruction::Unary { op, dst, src })
    }

    /// `dst = lhs op rhs`
    pub fn binary(&mut self, op: SymbolicOp, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.push(Instruction::Binary { op, dst, lhs, rhs })
    }

    /// `dst = lhs op imm`
    pub fn binary_imm(&mut self, op: SymbolicOp, dst: Reg, lhs: Reg, imm: u64) -> &mut Self {
        self.push(Instruction::BinaryImm { op, dst, lhs, imm })
    }

    /// `dst = lhs + imm`
    pub fn add_imm(&mut self, dst: Reg, lhs: Reg, imm: u64) -> &mut Self {
        self.binary_imm(SymbolicOp::Add, dst, lhs, imm)
    }

    /// `dst = lhs - imm`
    pub fn sub_imm(&mut self, dst: Reg, lhs: Reg, imm: u64) -> &mut Self {
        self.binary_imm(SymbolicOp::Sub, dst, lhs, imm)
    }

    /// `dst = lhs ^ imm`
    pub fn xor_imm(&mut self, dst: Reg, lhs: Reg, imm: u64) -> &mut Self {
        self.binary_imm(SymbolicOp::Xor, dst, lhs, imm)
    }

    /// `dst = cond != 0 ? then : otherwise`
    pub fn select(&mut self, dst: Reg, cond: Reg, then: Reg, otherwise: Reg) -> &mut Self {
        self.push(Instruction::Select {
            dst,
            cond,
            then,
            otherwise,
        })
    }

    /// `dst = next runtime counter byte`
    pub fn counter(&mut self, dst: Reg) -> &mut Self {
        self.push(Instruction::Counter { dst })
    }

    /// Writes the low byte of `src` to `channel`.
    pub fn emit(&mut self, channel: ChannelId, src: Reg) -> &mut Self {
        self.push(Instruction::Emit { channel, src })
    }

    /// Writes literal bytes to `channel`.
    pub fn emit_bytes(&mut self, channel: ChannelId, bytes: &[u8]) -> &mut Self {
        self.push(Instruction::EmitBytes {
            channel,
            bytes: bytes.to_vec(),
        })
    }

    /// Continues at `label`.
    pub fn jump(&mut self, label: &str) -> &mut Self {
        self.fixups
            .push((self.instructions.len(), label.to_string()));
        self.push(Instruction::Jump { target: 0 })
    }

    /// Continues at `label` if `cond` is non-zero.
    pub fn branch_if(&mut self, cond: Reg, label: &str) -> &mut Self {
        self.fixups
            .push((self.instructions.len(), label.to_string()));
        self.push(Instruction::BranchIf { cond, target: 0 })
    }

    /// Stops execution normally.
    pub fn halt(&mut self) -> &mut Self {
        self.push(Instruction::Halt)
    }

    /// Stops execution with a crash.
    pub fn fault(&mut self, reason: &str) -> &mut Self {
        self.push(Instruction::Fault {
            reason: reason.to_string(),
        })
    }

    /// Resolves all labels and returns the program.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a branch references an undefined label or
    /// an instruction names a register beyond `r15`.
    pub fn finish(mut self) -> Result<Program> {
        for (position, label) in &self.fixups {
            let resolved = *self
                .labels
                .get(label)
                .ok_or_else(|| invalid_input!("undefined label '{}'", label))?;
            match &mut self.instructions[*position] {
                Instruction::Jump { target } | Instruction::BranchIf { target, .. } => {
                    *target = resolved;
                }
                other => {
                    return Err(Error::InvalidInput {
                        message: format!("fixup at {position} points to {other:?}"),
                        file: file!(),
                        line: line!(),
                    })
                }
            }
        }

        if let Some(bad) = self
            .instructions
            .iter()
            .flat_map(registers)
            .find(|reg| reg.index() >= Reg::COUNT)
        {
            return Err(invalid_input!("register {} does not exist", bad));
        }

        Ok(Program::new(self.instructions))
    }
}

fn registers(instruction: &Instruction) -> Vec<Reg> {
    match instruction {
        Instruction::LoadInput { dst, .. }
        | Instruction::Imm { dst, .. }
        | Instruction::Counter { dst } => vec![*dst],
        Instruction::LoadInputReg { dst, index } => vec![*dst, *index],
        Instruction::Load { dst, offset, .. } => vec![*dst, *offset],
        Instruction::Mov { dst, src } | Instruction::Unary { dst, src, .. } => vec![*dst, *src],
        Instruction::Binary { dst, lhs, rhs, .. } => vec![*dst, *lhs, *rhs],
        Instruction::BinaryImm { dst, lhs, .. } => vec![*dst, *lhs],
        Instruction::Select {
            dst,
            cond,
            then,
            otherwise,
        } => vec![*dst, *cond, *then, *otherwise],
        Instruction::Emit { src, .. } => vec![*src],
        Instruction::BranchIf { cond, .. } => vec![*cond],
        Instruction::EmitBytes { .. }
        | Instruction::Jump { .. }
        | Instruction::Halt
        | Instruction::Fault { .. } => Vec::new(),
    }
}
