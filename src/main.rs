use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tiervm::bytecode::disasm::{disassemble_program, validate_chunk};
use tiervm::bytecode::{CompileError, Program, compile};
use tiervm::config::{CompilerConfig, VmConfig};
use tiervm::lang::node::{self, BinaryOp, Expr, Param, Stmt};
use tiervm::lang::value::ScalarType;
use tiervm::runtime::Vm;

#[derive(Parser)]
#[command(name = "tiervm", version, about = "Register-tiered bytecode VM")]
struct Cli {
    /// Log allocator and frame activity (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a JSON syntax tree or a compiled program
    Run {
        file: PathBuf,
        /// Print the disassembly before running
        #[arg(long)]
        disasm: bool,
    },
    /// Compile a JSON syntax tree to a program file
    Compile {
        file: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Disassemble a JSON syntax tree or a compiled program
    Disasm { file: PathBuf },
    /// Compile and run a built-in sample
    Demo,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run { file, disasm } => {
            let program = load(&file)?;
            if disasm {
                print!("{}", disassemble_program(&program));
            }
            execute(&program)
        }
        Command::Compile { file, output } => {
            let program = compile_file(&file)?;
            let bytes = program.to_bytes()?;
            fs::write(&output, bytes)
                .with_context(|| format!("failed to write '{}'", output.display()))?;
            println!(
                "compiled {} function(s) to {}",
                program.functions.len(),
                output.display()
            );
            Ok(())
        }
        Command::Disasm { file } => {
            let program = load(&file)?;
            print!("{}", disassemble_program(&program));
            Ok(())
        }
        Command::Demo => {
            let program = compile(&demo(), &CompilerConfig::from_env()).map_err(with_hint)?;
            print!("{}", disassemble_program(&program));
            println!("=== OUTPUT ===");
            execute(&program)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn execute(program: &Program) -> Result<()> {
    let mut vm = Vm::with_config(VmConfig::from_env());
    vm.run(program)?;
    Ok(())
}

/// JSON files are syntax trees and get compiled; anything else must be a
/// program written by `compile`.
fn load(path: &Path) -> Result<Program> {
    if is_json(path) {
        return compile_file(path);
    }
    let bytes = fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    let program = Program::from_bytes(&bytes)
        .with_context(|| format!("'{}' is not a compiled program", path.display()))?;
    validate_chunk(&program.main)?;
    for f in &program.functions {
        validate_chunk(&f.chunk).with_context(|| format!("in function '{}'", f.name))?;
    }
    Ok(program)
}

fn compile_file(path: &Path) -> Result<Program> {
    if !is_json(path) {
        bail!("expected a .json syntax tree, got '{}'", path.display());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    let ast: node::Program = serde_json::from_str(&text)
        .with_context(|| format!("'{}' is not a valid syntax tree", path.display()))?;
    compile(&ast, &CompilerConfig::from_env()).map_err(with_hint)
}

fn with_hint(e: CompileError) -> anyhow::Error {
    match e.hint() {
        Some(hint) => anyhow!("{}\n  hint: {}", e, hint),
        None => e.into(),
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

/// Factorial, a typed counting loop and a closure counter.
fn demo() -> node::Program {
    let int = |name: &str| Expr::var(name).typed(ScalarType::I32);

    let fact = Stmt::function(
        "fact",
        vec![Param::new("n", Some(ScalarType::I32))],
        vec![
            Stmt::if_(
                Expr::binary(BinaryOp::Le, int("n"), Expr::i32(1)),
                vec![Stmt::return_(Some(Expr::i32(1)))],
                None,
            ),
            Stmt::return_(Some(Expr::binary(
                BinaryOp::Mul,
                int("n"),
                Expr::call(
                    Expr::var("fact"),
                    vec![Expr::binary(BinaryOp::Sub, int("n"), Expr::i32(1))],
                ),
            ))),
        ],
    );

    let counter = Stmt::function(
        "counter",
        vec![],
        vec![
            Stmt::let_("count", Expr::i32(0)),
            Stmt::return_(Some(Expr::lambda(
                vec![],
                vec![
                    Stmt::assign(
                        "count",
                        Expr::binary(BinaryOp::Add, Expr::var("count"), Expr::i32(1)),
                    ),
                    Stmt::return_(Some(Expr::var("count"))),
                ],
            ))),
        ],
    );

    node::Program::new(vec![
        fact,
        Stmt::print(Expr::call(Expr::var("fact"), vec![Expr::i32(10)])),
        Stmt::let_("sum", Expr::i32(0)),
        Stmt::for_range(
            "i",
            Expr::i32(0),
            Expr::i32(100),
            vec![Stmt::assign(
                "sum",
                Expr::binary(BinaryOp::Add, int("sum"), int("i")),
            )],
        ),
        Stmt::print(Expr::var("sum")),
        counter,
        Stmt::let_("next", Expr::call(Expr::var("counter"), vec![])),
        Stmt::expr(Expr::call(Expr::var("next"), vec![])),
        Stmt::print(Expr::call(Expr::var("next"), vec![])),
    ])
}
