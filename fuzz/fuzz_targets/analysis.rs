#![no_main]

use libfuzzer_sys::fuzz_target;
use leakscope::prelude::*;

const FLAG_BASE: u64 = 0x4347_c000;
const FLAG: &[u8; 8] = b"fuzzflag";

// Every 4 input bytes decode to one instruction; the remainder is the target input.
fuzz_target!(|data: &[u8]| {
    let split = data.len() / 2 / 4 * 4;
    let (code, input) = data.split_at(split);

    let mut asm = ProgramAssembler::new();
    for chunk in code.chunks_exact(4) {
        let dst = Reg(chunk[1] % 16);
        let src = Reg(chunk[2] % 16);
        let imm = u64::from(chunk[3]);
        match chunk[0] % 8 {
            0 => asm.load_input(dst, u32::from(chunk[3])),
            1 => asm.load(dst, FLAG_BASE, src),
            2 => asm.imm(dst, imm),
            3 => asm.binary_imm(SymbolicOp::Xor, dst, src, imm),
            4 => asm.binary(SymbolicOp::Add, dst, dst, src),
            5 => asm.binary_imm(SymbolicOp::ShrU, dst, src, imm % 8),
            6 => asm.counter(dst),
            _ => asm.emit(ChannelId::STDOUT, src),
        };
    }
    asm.halt();
    let Ok(program) = asm.finish() else {
        return;
    };

    let target = SimMachine::new(program, FLAG_BASE, FLAG.to_vec());
    let Ok(flag) = FlagRegion::new(FLAG_BASE, FLAG.len() as u32) else {
        return;
    };
    let Ok(truth) = FlagGroundTruth::new(&flag, FLAG.to_vec()) else {
        return;
    };
    let solver = EnumerativeSolver::default();
    let config = AnalysisConfig::fast();

    let analysis = LeakAnalysis::new(&target, &solver, &config, flag, input.to_vec());
    if let Ok(artifact) = analysis.exploit(&truth) {
        assert!(artifact.is_validated());
        for offset in artifact.covered_offsets() {
            let _ = artifact.build_input_for_offset(offset);
        }
    }
});
