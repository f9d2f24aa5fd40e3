//! `tacit-dump`: diagnostic CLI for disassembling and running the crate's
//! hardcoded demo programs, and for inspecting a persisted snapshot.
//! Shaped after the teacher's `idb-tools` dump binary: one `clap::Parser`
//! `Args` wrapping a `Subcommand` enum, one function per operation.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};

use tacit::compiler::Token;
use tacit::opcodes::Op;
use tacit::snapshot::Snapshot;
use tacit::value::Decoded;
use tacit::{Vm, VmConfig};

#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

/// One of the worked scenarios from §8, compiled on demand. A real
/// deployment would source tokens from the external tokenizer this crate
/// doesn't implement; these stand in as fixed diagnostic payloads.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Program {
    /// `: square dup * ; : inc 1 + ; 5 square inc` (S1)
    SquareInc,
    /// `( 1 2 ) ( 3 4 ) concat length` (S3)
    ConcatLength,
    /// `( 1 ( 2 3 ) 4 ) length` (S4)
    NestedLength,
}

impl Program {
    fn tokens(self) -> Vec<Token> {
        let num = Token::Number;
        let word = |w: &str| Token::Word(w.to_string());
        let sp = Token::Special;
        match self {
            Program::SquareInc => vec![
                sp(':'), word("square"), word("dup"), word("*"), sp(';'),
                sp(':'), word("inc"), num(1.0), word("+"), sp(';'),
                num(5.0), word("square"), word("inc"),
            ],
            Program::ConcatLength => vec![
                sp('('), num(1.0), num(2.0), sp(')'),
                sp('('), num(3.0), num(4.0), sp(')'),
                word("concat"), word("length"),
            ],
            Program::NestedLength => vec![
                sp('('), num(1.0), sp('('), num(2.0), num(3.0), sp(')'), num(4.0), sp(')'),
                word("length"),
            ],
        }
    }
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Compile a demo program and print its CODE segment as an instruction listing
    Disasm(ProgramArgs),
    /// Compile and run a demo program, printing the final data stack
    Run(RunArgs),
    /// Load a persisted snapshot and print its CP/BP_code and segment sizes
    InspectSnapshot(InspectSnapshotArgs),
}

#[derive(Clone, Debug, clap::Args)]
struct ProgramArgs {
    #[arg(value_enum)]
    program: Program,
}

#[derive(Clone, Debug, clap::Args)]
struct RunArgs {
    #[arg(value_enum)]
    program: Program,
    /// Save a snapshot of the compiled VM to this path after running
    #[arg(long)]
    save_snapshot: Option<PathBuf>,
}

#[derive(Clone, Debug, clap::Args)]
struct InspectSnapshotArgs {
    path: PathBuf,
}

fn disasm(args: &ProgramArgs) -> Result<()> {
    let mut vm = Vm::new(VmConfig::default()).map_err(|e| anyhow!(e))?;
    vm.compile(&args.program.tokens()).map_err(|e| anyhow!(e))?;
    let code = vm.memory().code_bytes();
    let mut ip = 0usize;
    while ip < code.len() {
        let byte = code[ip];
        let Ok(op) = Op::try_from(byte) else {
            println!("{ip:04x}: <invalid opcode {byte:#04x}>");
            break;
        };
        let width = tacit::opcodes::operand_size(op);
        let operand = read_operand(code, ip + 1, width);
        match width {
            0 => println!("{ip:04x}: {op:?}"),
            _ => println!("{ip:04x}: {op:?} {operand}"),
        }
        ip += 1 + width;
    }
    Ok(())
}

fn read_operand(code: &[u8], offset: usize, width: usize) -> u32 {
    match width {
        0 => 0,
        1 => code[offset] as u32,
        2 => u16::from_le_bytes([code[offset], code[offset + 1]]) as u32,
        4 => u32::from_le_bytes([code[offset], code[offset + 1], code[offset + 2], code[offset + 3]]),
        _ => unreachable!("operand widths are 0/1/2/4"),
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let mut vm = Vm::new(VmConfig::default()).map_err(|e| anyhow!(e))?;
    vm.compile(&args.program.tokens()).map_err(|e| anyhow!(e))?;
    vm.run_from(0).map_err(|e| anyhow!(e))?;
    let stack = vm.data_stack().map_err(|e| anyhow!(e))?;
    for (i, cell) in stack.iter().enumerate() {
        match cell.decode() {
            Ok(Decoded::Number(n)) => println!("[{i}] {n}"),
            Ok(Decoded::Tagged { tag, payload }) => println!("[{i}] {tag:?}:{payload}"),
            Err(e) => println!("[{i}] <{e}>"),
        }
    }
    if let Some(path) = &args.save_snapshot {
        vm.snapshot().save(path).map_err(|e| anyhow!(e))?;
        println!("snapshot written to {}", path.display());
    }
    Ok(())
}

fn inspect_snapshot(args: &InspectSnapshotArgs) -> Result<()> {
    let snap = Snapshot::load(&args.path).map_err(|e| anyhow!(e))?;
    println!("cp: {}", snap.cp);
    println!("bp_code: {}", snap.bp_code);
    println!("code bytes: {}", snap.code.len());
    println!("interned strings: {}", snap.strings.len());
    for (i, s) in snap.strings.iter().enumerate() {
        println!("  [{i}] {:?}", String::from_utf8_lossy(s));
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    match &args.operation {
        Operation::Disasm(program_args) => disasm(program_args),
        Operation::Run(run_args) => run(run_args),
        Operation::InspectSnapshot(snapshot_args) => inspect_snapshot(snapshot_args),
    }
}
