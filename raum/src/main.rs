use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use raum::{GcPolicy, Vm, VmCreateInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GcMode {
    /// Only collect when the program asks for it.
    Never,
    /// Collect and retry once when an allocation fails.
    OnAllocFailure,
    /// Collect every --gc-interval instructions.
    Periodic,
}

#[derive(Parser, Debug)]
#[command(name = "raum", about = "Bytecode virtual machine")]
struct Args {
    /// Root module to load and run.
    module: PathBuf,

    /// Directory searched for dependency modules (<name>.rx); repeatable.
    #[arg(long = "module-path", value_name = "DIR")]
    module_paths: Vec<PathBuf>,

    /// Execution stack capacity in slots.
    #[arg(long)]
    stack_slots: Option<u32>,

    /// Heap capacity in bytes.
    #[arg(long)]
    heap_size: Option<u32>,

    /// Garbage collection trigger policy.
    #[arg(long, value_enum, default_value_t = GcMode::OnAllocFailure)]
    gc: GcMode,

    /// Instruction interval for --gc periodic.
    #[arg(long, default_value_t = 100_000)]
    gc_interval: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut info = VmCreateInfo {
        gc: match args.gc {
            GcMode::Never => GcPolicy::Never,
            GcMode::OnAllocFailure => GcPolicy::OnAllocFailure,
            GcMode::Periodic => GcPolicy::Periodic(args.gc_interval),
        },
        module_paths: args.module_paths,
        ..Default::default()
    };
    if let Some(slots) = args.stack_slots {
        info.stack_slots = slots;
    }
    if let Some(size) = args.heap_size {
        info.heap_size = size;
    }

    if let Err(err) = launch(info, &args.module) {
        eprintln!("raum: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn launch(info: VmCreateInfo, module: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(module)?;
    let mut vm = Vm::new(info)?;
    vm.load_and_run(&bytes)?;
    Ok(())
}
