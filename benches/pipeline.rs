#![allow(unused)]
extern crate leakscope;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use leakscope::prelude::*;
use std::hint::black_box;

const FLAG_BASE: u64 = 0x4347_c000;

/// Builds a target that prints every byte of `flag` as two lowercase hex digits.
fn hex_target(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    for offset in 0..flag.len() as u64 {
        asm.imm(Reg(1), offset).load(Reg(0), FLAG_BASE, Reg(1));
        for shift in [4u64, 0] {
            asm.binary_imm(SymbolicOp::ShrU, Reg(2), Reg(0), shift)
                .binary_imm(SymbolicOp::And, Reg(2), Reg(2), 0xf)
                .binary_imm(SymbolicOp::LtU, Reg(3), Reg(2), 10)
                .add_imm(Reg(4), Reg(2), u64::from(b'0'))
                .add_imm(Reg(5), Reg(2), u64::from(b'a') - 10)
                .select(Reg(6), Reg(3), Reg(4), Reg(5))
                .emit(ChannelId::STDOUT, Reg(6));
        }
    }
    asm.halt();
    SimMachine::new(asm.finish().unwrap(), FLAG_BASE, flag.to_vec())
}

/// Builds a target that prints the flag byte selected by the first input byte.
fn indexed_target(flag: &[u8]) -> SimMachine {
    let mut asm = ProgramAssembler::new();
    asm.emit_bytes(ChannelId::STDOUT, b"leak data:")
        .load_input(Reg(1), 0)
        .binary_imm(SymbolicOp::RemU, Reg(1), Reg(1), flag.len() as u64)
        .load(Reg(0), FLAG_BASE, Reg(1))
        .xor_imm(Reg(0), Reg(0), 0x20)
        .emit(ChannelId::STDOUT, Reg(0))
        .halt();
    SimMachine::new(asm.finish().unwrap(), FLAG_BASE, flag.to_vec())
}

/// Benchmark detection (two traces, location and classification) on a hex dump
/// of a full 4 KiB flag page.
fn bench_detect(c: &mut Criterion) {
    let flag: Vec<u8> = (0..4096u32).map(|i| (i * 31 + 7) as u8).collect();
    let target = hex_target(&flag);
    let region = FlagRegion::new(FLAG_BASE, flag.len() as u32).unwrap();
    let solver = EnumerativeSolver::default();
    let config = AnalysisConfig::default();

    let mut group = c.benchmark_group("detect");
    group.throughput(Throughput::Bytes(flag.len() as u64));
    group.sample_size(10);
    group.bench_function("hex_4k", |b| {
        b.iter(|| {
            let analysis = LeakAnalysis::new(&target, &solver, &config, region, Vec::new());
            black_box(analysis.detect().unwrap())
        });
    });
    group.finish();
}

/// Benchmark the full pipeline including probing and validation.
fn bench_exploit(c: &mut Criterion) {
    let flag = b"flag{benchmarking_the_probe_sweep}".to_vec();
    let target = indexed_target(&flag);
    let region = FlagRegion::new(FLAG_BASE, flag.len() as u32).unwrap();
    let truth = FlagGroundTruth::new(&region, flag.clone()).unwrap();
    let solver = EnumerativeSolver::default();
    let config = AnalysisConfig::default();

    c.bench_function("exploit_indexed", |b| {
        b.iter(|| {
            let analysis = LeakAnalysis::new(&target, &solver, &config, region, b"A".to_vec());
            black_box(analysis.exploit(&truth).unwrap())
        });
    });
}

/// Benchmark truth-table style evaluation of a compiled expression.
fn bench_compiled_eval(c: &mut Criterion) {
    let mut arena = ExprArena::new();
    let flag = arena.flag_byte(0);
    let four = arena.constant(4);
    let high = arena.binary(SymbolicOp::ShrU, flag, four);
    let ten = arena.constant(10);
    let is_digit = arena.binary(SymbolicOp::LtU, high, ten);
    let zero = arena.constant(u64::from(b'0'));
    let digit = arena.binary(SymbolicOp::Add, high, zero);
    let alpha = arena.constant(u64::from(b'a') - 10);
    let letter = arena.binary(SymbolicOp::Add, high, alpha);
    let root = arena.select(is_digit, digit, letter);
    let compiled = arena.compile(root);

    c.bench_function("compiled_truth_table", |b| {
        b.iter(|| {
            let mut table = [0u8; 256];
            for (value, entry) in table.iter_mut().enumerate() {
                *entry = compiled.evaluate(&[value as u64]) as u8;
            }
            black_box(table)
        });
    });
}

criterion_group!(benches, bench_detect, bench_exploit, bench_compiled_eval);
criterion_main!(benches);
