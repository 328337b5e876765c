//! bcplc — the BCPL compiler driver.
//!
//! Orders the passes, reports diagnostics, and writes the selected output:
//! an assembly file (`--asm`), an assembled-and-linked executable
//! (`--exec`), or in-process JIT execution (`--run`).

use anyhow::{anyhow, bail, Context, Result};
use bcpl_analysis::{cse, fold, licm, liveness, strength, Analyzer, CfgBuilder, SymbolTable};
use bcpl_analysis::symbols::{Symbol, SymbolKind};
use bcpl_ast::{FunctionType, VarType};
use bcpl_codegen::asm::AssemblyWriter;
use bcpl_codegen::instr::Opcode;
use bcpl_codegen::jit::JitImage;
use bcpl_codegen::peephole::PeepholeOptimizer;
use bcpl_codegen::{CodeGenerator, CodegenOptions, Linker};
use bcpl_runtime::standard_registry;
use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "bcplc")]
#[command(about = "BCPL compiler for AArch64", version)]
struct Cli {
    /// Source file to compile.
    source: PathBuf,

    /// JIT-compile and run in process.
    #[arg(long)]
    run: bool,

    /// Emit an assembly file next to the source.
    #[arg(long)]
    asm: bool,

    /// Assemble, link and run via the system toolchain.
    #[arg(long)]
    exec: bool,

    /// Enable the optimizer passes (folding, strength reduction, LICM, CSE).
    #[arg(long)]
    opt: bool,

    /// Enable the peephole pass over the encoded stream.
    #[arg(long)]
    peephole: bool,

    /// Write and check stack canaries in every frame.
    #[arg(long)]
    stack_canaries: bool,

    /// JIT entry-point symbol.
    #[arg(long, default_value = "START")]
    call: String,

    /// JIT breakpoint: replace the instruction this many words past the
    /// entry point with a BRK.
    #[arg(long, default_value = "0")]
    offset: usize,

    /// Include search path (repeatable).
    #[arg(short = 'I', long = "include")]
    include: Vec<PathBuf>,

    // Per-component tracing. These raise log levels only; they never change
    // what the compiler emits.
    #[arg(long)]
    trace_lexer: bool,
    #[arg(long)]
    trace_parser: bool,
    #[arg(long)]
    trace_ast: bool,
    #[arg(long)]
    trace_cfg: bool,
    #[arg(long)]
    trace_codegen: bool,
    #[arg(long)]
    trace_optimizer: bool,
    #[arg(long)]
    trace_liveness: bool,
    #[arg(long)]
    trace_runtime: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    if let Err(err) = compile(&cli) {
        eprintln!("bcplc: {:#}", err);
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut builder = env_logger::Builder::from_default_env();
    let mut enable = |on: bool, target: &str| {
        if on {
            builder.filter_module(target, log::LevelFilter::Trace);
        }
    };
    enable(cli.trace_lexer || cli.trace_parser, "bcpl_parser");
    enable(cli.trace_ast, "bcpl_analysis::analyzer");
    enable(cli.trace_cfg, "bcpl_analysis::cfg");
    enable(
        cli.trace_optimizer,
        "bcpl_analysis::cse",
    );
    enable(cli.trace_optimizer, "bcpl_analysis::fold");
    enable(cli.trace_liveness, "bcpl_analysis::liveness");
    enable(cli.trace_codegen, "bcpl_codegen");
    enable(cli.trace_runtime, "bcpl_runtime");
    let _ = builder.try_init();
}

fn read_source(cli: &Cli) -> Result<String> {
    if cli.source.exists() {
        return std::fs::read_to_string(&cli.source)
            .with_context(|| format!("reading {}", cli.source.display()));
    }
    for dir in &cli.include {
        let candidate = dir.join(&cli.source);
        if candidate.exists() {
            return std::fs::read_to_string(&candidate)
                .with_context(|| format!("reading {}", candidate.display()));
        }
    }
    bail!("source file {} not found", cli.source.display())
}

/// Seed the symbol table with every registered runtime function so the
/// analyzer can classify calls.
fn seed_runtime_symbols(table: &mut SymbolTable, registry: &bcpl_runtime::RuntimeRegistry) {
    for func in registry.iter() {
        let kind = match func.fn_type {
            FunctionType::Float => SymbolKind::RuntimeFloatFunction,
            FunctionType::Standard => SymbolKind::RuntimeFunction,
        };
        let var_type = match func.fn_type {
            FunctionType::Float => VarType::FLOAT,
            FunctionType::Standard => VarType::INTEGER,
        };
        let mut symbol = Symbol::new(func.name.clone(), kind, var_type, 0);
        symbol.parameters = vec![VarType::INTEGER; func.num_args];
        table.add_global(symbol);
    }
}

fn compile(cli: &Cli) -> Result<()> {
    let source = read_source(cli)?;
    let registry = standard_registry();

    // Front end.
    let mut program = bcpl_parser::parse_source(&source).map_err(|e| anyhow!("{}", e))?;

    // Semantic analysis.
    let mut table = SymbolTable::new();
    seed_runtime_symbols(&mut table, &registry);
    let output = Analyzer::new().analyze(&mut program, &mut table);
    let mut metrics = output.metrics;
    if !output.diagnostics.is_empty() {
        for diagnostic in &output.diagnostics {
            eprintln!("error: {}", diagnostic);
        }
        bail!("{} semantic error(s)", output.diagnostics.len());
    }

    // AST-level optimizer passes.
    if cli.opt {
        fold::ConstantFoldingPass::new().run(&mut program, &table);
        strength::StrengthReductionPass::new().run(&mut program);
        licm::LoopInvariantCodeMotionPass::new().run(&mut program, &mut table, &mut metrics);
    }

    // Control-flow graphs, block-local CSE, liveness.
    let mut cfgs = CfgBuilder::new()
        .build(&program)
        .map_err(|e| anyhow!("{}", e))?;
    if cli.opt {
        cse::LocalOptimizationPass::new().run(&mut cfgs, &mut table, &mut metrics);
    }
    for (name, cfg) in &cfgs {
        let info = liveness::analyze(cfg);
        if let Some(m) = metrics.get_mut(name) {
            m.max_live_variables = info.register_pressure();
        }
    }

    // Back end. The JIT image is reserved up front so the generator knows
    // the real buffer bases for the runtime-call range check.
    let jit_mode = cli.run;
    let image = if jit_mode {
        Some(JitImage::reserve().map_err(|e| anyhow!("{}", e))?)
    } else {
        None
    };
    let options = CodegenOptions {
        jit_mode,
        enable_stack_canaries: cli.stack_canaries,
        code_base: image.as_ref().map(|i| i.code.base_address()).unwrap_or(0),
        data_base: image.as_ref().map(|i| i.data.base_address()).unwrap_or(0),
    };

    let generator = CodeGenerator::new(options.clone(), &table, &metrics, &registry);
    let mut generated = generator
        .generate(&program, &cfgs)
        .map_err(|e| anyhow!("{}", e))?;

    if cli.peephole {
        let mut optimizer = PeepholeOptimizer::new();
        optimizer.optimize(generated.stream.instructions_mut());
    }

    if cli.asm || cli.exec {
        let asm_text =
            AssemblyWriter::new(&registry).write(generated.stream.instructions(), &generated.data);
        let asm_path = cli.source.with_extension("s");
        std::fs::write(&asm_path, &asm_text)
            .with_context(|| format!("writing {}", asm_path.display()))?;
        println!("wrote {}", asm_path.display());
        if cli.exec {
            assemble_and_run(&asm_path)?;
        }
    }

    if cli.run {
        let mut image = image.expect("image reserved in jit mode");
        let mut labels = generated.labels;
        let linked = Linker::new()
            .process(
                generated.stream,
                &mut labels,
                &registry,
                options.code_base,
                options.data_base,
            )
            .map_err(|e| anyhow!("{}", e))?;

        let entry = labels
            .address_of(&cli.call)
            .map_err(|e| anyhow!("{}", e))?;

        let mut linked = linked;
        if cli.offset > 0 {
            plant_breakpoint(&mut linked, entry, cli.offset);
        }

        image
            .load(&linked, &registry)
            .map_err(|e| anyhow!("{}", e))?;

        log::debug!("jumping to {} at {:#x}", cli.call, entry);
        let result = unsafe { image.call(entry) };
        log::debug!("JIT returned {}", result);
    }

    Ok(())
}

/// Replace the instruction `offset` words past the entry with a BRK.
fn plant_breakpoint(linked: &mut [bcpl_codegen::Instruction], entry: u64, offset: usize) {
    let target = entry + (offset as u64) * 4;
    for instr in linked.iter_mut() {
        if !instr.is_label_definition
            && instr.address == target
            && instr.opcode != Opcode::Data
        {
            *instr = bcpl_codegen::encoder::brk(0xF0);
            instr.address = target;
            return;
        }
    }
    log::warn!("breakpoint offset {} is past the end of the entry function", offset);
}

/// `--exec`: assemble with the system compiler driver and run the result.
fn assemble_and_run(asm_path: &Path) -> Result<()> {
    let binary = asm_path.with_extension("out");
    let status = std::process::Command::new("cc")
        .arg(asm_path)
        .arg("-o")
        .arg(&binary)
        .status()
        .context("invoking the system assembler")?;
    if !status.success() {
        bail!("assembly failed with {}", status);
    }
    let run = std::process::Command::new(&binary)
        .status()
        .with_context(|| format!("running {}", binary.display()))?;
    if !run.success() {
        bail!("program exited with {}", run);
    }
    Ok(())
}
