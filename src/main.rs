use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use zplc_runtime::config::RuntimeConfig;
use zplc_runtime::hal::sim::SimulatedHal;
use zplc_runtime::loader;
use zplc_runtime::log::Logger;
use zplc_runtime::orchestrator::Orchestrator;
use zplc_runtime::shell::Shell;

#[derive(Parser)]
#[command(name = "zplc-runtime", about = "A deterministic soft-PLC runtime for compiled IEC 61131-3 bytecode")]
struct Args {
    /// Path to a compiled `.zplc` program package.
    #[arg(long)]
    program: Option<PathBuf>,

    /// Optional YAML configuration file overriding the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the simulated HAL persists RETAIN and other state under.
    #[arg(long)]
    retain_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Drop into the line-oriented operator shell instead of free-running.
    #[arg(long)]
    shell: bool,
}

fn main() {
    let args = Args::parse();
    let logger = Logger::new(&args.log_level);

    let config = match &args.config {
        Some(path) => match RuntimeConfig::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "failed to load config, using defaults");
                RuntimeConfig::default()
            }
        },
        None => RuntimeConfig::default(),
    };

    let retain_dir = args.retain_dir.or_else(|| config.retain_backing_dir.clone().map(PathBuf::from));

    if args.shell {
        run_shell(retain_dir, config.fatal_overrun_threshold_us, logger);
        return;
    }

    let Some(program_path) = args.program else {
        error!("no program specified; pass --program <file>.zplc or --shell");
        std::process::exit(1);
    };

    let bytes = match std::fs::read(&program_path) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, path = %program_path.display(), "failed to read program");
            std::process::exit(1);
        }
    };

    let program = match loader::parse(&bytes) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to parse program");
            std::process::exit(1);
        }
    };

    let hal = SimulatedHal::new(retain_dir);
    let mut orchestrator = Orchestrator::new(hal, &program, config.fatal_overrun_threshold_us);
    orchestrator.start();
    info!("runtime started, entering scan cycle loop");
    orchestrator.run_forever();
}

fn run_shell(retain_dir: Option<PathBuf>, fatal_overrun_threshold_us: u32, logger: Logger) {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut shell: Shell<SimulatedHal> =
        Shell::new(Box::new(move || SimulatedHal::new(retain_dir.clone())), fatal_overrun_threshold_us)
            .with_logger(logger);
    if let Err(e) = shell.run(stdin.lock(), stdout.lock()) {
        error!(error = %e, "shell terminated");
    }
}
