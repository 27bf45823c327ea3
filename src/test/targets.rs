//! Reference targets for the pipeline tests.

use crate::{
    engine::ChannelId,
    expr::SymbolicOp,
    sim::{ProgramAssembler, Reg, SimMachine},
    test::FLAG_BASE,
};

const OUT: ChannelId = ChannelId::STDOUT;

fn machine(asm: ProgramAssembler, flag: &[u8]) -> SimMachine {
    SimMachine::new(asm.finish().unwrap(), FLAG_BASE, flag.to_vec())
}

fn load_flag(asm: &mut ProgramAssembler, dst: Reg, offset: u64) {
    asm.imm(Reg(15), offset).load(dst, FLAG_BASE, Reg(15));
}

/// Writes every flag byte unchanged, starting at output position 0.
pub fn verbatim_copy(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    for offset in 0..flag.len() as u64 {
        load_flag(&mut asm, Reg(0), offset);
        asm.emit(OUT, Reg(0));
    }
    asm.halt();
    machine(asm, flag)
}

/// Writes `flag[i] ^ key` for every flag byte.
pub fn xor_key(flag: &[u8], key: u8) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    for offset in 0..flag.len() as u64 {
        load_flag(&mut asm, Reg(0), offset);
        asm.xor_imm(Reg(0), Reg(0), u64::from(key))
            .emit(OUT, Reg(0));
    }
    asm.halt();
    machine(asm, flag)
}

/// Prints a ten-byte banner, then `flag[input[0] % len] ^ 0x20` at output position 10.
pub fn xor_indexed(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    asm.emit_bytes(OUT, b"leak data:")
        .load_input(Reg(1), 0)
        .binary_imm(SymbolicOp::RemU, Reg(1), Reg(1), flag.len() as u64)
        .load(Reg(0), FLAG_BASE, Reg(1))
        .xor_imm(Reg(0), Reg(0), 0x20)
        .emit(OUT, Reg(0))
        .emit_bytes(OUT, b"\n")
        .halt();
    machine(asm, flag)
}

/// Writes every flag byte as two lowercase hex digits.
pub fn hex_leak(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    for offset in 0..flag.len() as u64 {
        load_flag(&mut asm, Reg(0), offset);
        asm.binary_imm(SymbolicOp::ShrU, Reg(2), Reg(0), 4);
        hex_digit(&mut asm, Reg(2));
        asm.binary_imm(SymbolicOp::And, Reg(2), Reg(0), 0xf);
        hex_digit(&mut asm, Reg(2));
    }
    asm.halt();
    machine(asm, flag)
}

fn hex_digit(asm: &mut ProgramAssembler, nibble: Reg) {
    asm.binary_imm(SymbolicOp::LtU, Reg(3), nibble, 10)
        .add_imm(Reg(4), nibble, u64::from(b'0'))
        .add_imm(Reg(5), nibble, u64::from(b'a') - 10)
        .select(Reg(6), Reg(3), Reg(4), Reg(5))
        .emit(OUT, Reg(6));
}

/// Writes `flag[0]` as two hex digits, followed by two bytes of `flag[0] ^ counter`
/// with the counter tracked as runtime state.
pub fn hex_with_counter(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    load_flag(&mut asm, Reg(0), 0);
    asm.binary_imm(SymbolicOp::ShrU, Reg(2), Reg(0), 4);
    hex_digit(&mut asm, Reg(2));
    asm.binary_imm(SymbolicOp::And, Reg(2), Reg(0), 0xf);
    hex_digit(&mut asm, Reg(2));
    for _ in 0..2 {
        asm.counter(Reg(2))
            .binary(SymbolicOp::Xor, Reg(7), Reg(0), Reg(2))
            .emit(OUT, Reg(7));
    }
    asm.halt();
    machine(asm, flag)
}

/// Writes `flag[0] ^ flag[1]`, then `flag[1] ^ 0x5a`.
pub fn pair_with_key(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    load_flag(&mut asm, Reg(0), 0);
    load_flag(&mut asm, Reg(1), 1);
    asm.binary(SymbolicOp::Xor, Reg(0), Reg(0), Reg(1))
        .emit(OUT, Reg(0))
        .xor_imm(Reg(1), Reg(1), 0x5a)
        .emit(OUT, Reg(1))
        .halt();
    machine(asm, flag)
}

/// Writes `flag[0] ^ counter`, with the counter tracked as runtime state.
pub fn counter_leak(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    load_flag(&mut asm, Reg(0), 0);
    asm.counter(Reg(2))
        .binary(SymbolicOp::Xor, Reg(0), Reg(0), Reg(2))
        .emit(OUT, Reg(0))
        .halt();
    machine(asm, flag)
}

/// Writes `flag[i] ^ counter` for every byte, with a counter the engine does not
/// track, so that symbolic runs see a fixed key that changes with the seed.
pub fn challenge_response(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    for offset in 0..flag.len() as u64 {
        load_flag(&mut asm, Reg(0), offset);
        asm.counter(Reg(2))
            .binary(SymbolicOp::Xor, Reg(0), Reg(0), Reg(2))
            .emit(OUT, Reg(0));
    }
    asm.halt();
    machine(asm, flag).with_untracked_counter()
}

/// Writes `flag[0] + flag[1]`.
pub fn pair_sum(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    load_flag(&mut asm, Reg(0), 0);
    load_flag(&mut asm, Reg(1), 1);
    asm.binary(SymbolicOp::Add, Reg(0), Reg(0), Reg(1))
        .emit(OUT, Reg(0))
        .halt();
    machine(asm, flag)
}

/// Writes `flag[0] ^ flag[1] ^ flag[2]`.
pub fn triple_xor(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    load_flag(&mut asm, Reg(0), 0);
    load_flag(&mut asm, Reg(1), 1);
    load_flag(&mut asm, Reg(2), 2);
    asm.binary(SymbolicOp::Xor, Reg(0), Reg(0), Reg(1))
        .binary(SymbolicOp::Xor, Reg(0), Reg(0), Reg(2))
        .emit(OUT, Reg(0))
        .halt();
    machine(asm, flag)
}

/// Reads the flag but only ever prints a greeting.
pub fn no_leak(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    asm.emit_bytes(OUT, b"hello\n");
    load_flag(&mut asm, Reg(0), 0);
    asm.add_imm(Reg(0), Reg(0), 1).halt();
    machine(asm, flag)
}

/// Never terminates.
pub fn spin(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    asm.label("spin").unwrap().jump("spin");
    machine(asm, flag)
}

/// Crashes immediately.
pub fn crash(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    asm.fault("segmentation fault");
    machine(asm, flag)
}
