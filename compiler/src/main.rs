use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dfspec::pass::PassId;
use dfspec::pipeline::{
    compute_provenance, run_pipeline, Bundle, SpecializationState, SpecializeOptions,
};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Specialized program as textual IR
    Ir,
    /// Scaffolded program before specialization
    Unspecialized,
    /// Counts gathered by each pass
    Summary,
    /// Input hash and output fingerprint as JSON
    Fingerprint,
}

#[derive(Parser, Debug)]
#[command(
    name = "dfspec",
    version,
    about = "Dataflow specializer — flattens a scheduled actor graph into unboxed imperative IR"
)]
struct Cli {
    /// Input bundle (JSON: graph, schedules, ir)
    bundle: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Firings repeated fewer times than this are unrolled
    #[arg(long, default_value_t = 2)]
    threshold: u32,

    /// Bound on call-site inlining rounds
    #[arg(long, default_value_t = 20)]
    max_inline_rounds: usize,

    /// Deepest token nesting considered for unboxing (at most 4)
    #[arg(long, default_value_t = 4)]
    max_type_depth: usize,

    /// Skip the final dead-code sweep
    #[arg(long)]
    keep_dead_code: bool,

    /// Print passes and timing, and debug events of each pass
    #[arg(long)]
    verbose: bool,
}

/// Route `tracing` events to stderr. `RUST_LOG` wins; `--verbose` alone
/// shows this crate's debug events.
fn init_tracing(verbose: bool) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) if verbose => EnvFilter::new("dfspec=debug"),
        Err(_) => return,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        eprintln!("dfspec: bundle = {}", cli.bundle.display());
        eprintln!("dfspec: emit   = {:?}", cli.emit);
    }

    // ── Read and parse the bundle ──
    let text = match std::fs::read_to_string(&cli.bundle) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("dfspec: error: {}: {}", cli.bundle.display(), e);
            std::process::exit(2);
        }
    };
    let bundle = match Bundle::from_json(&text) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("dfspec: error: {}", e);
            std::process::exit(2);
        }
    };
    let mut state = match SpecializationState::from_bundle(&bundle) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("dfspec: error: {}", e);
            std::process::exit(1);
        }
    };

    if cli.verbose {
        eprintln!(
            "dfspec: {} entities, {} user classes",
            state.graph.entity_count(),
            state.user.classes.len()
        );
    }

    // ── Run passes ──
    let options = SpecializeOptions {
        threshold: cli.threshold,
        max_inline_rounds: cli.max_inline_rounds,
        max_type_depth: cli.max_type_depth,
        eliminate_dead_code: !cli.keep_dead_code,
    };
    let terminal = match cli.emit {
        EmitStage::Unspecialized => PassId::Scaffold,
        _ => PassId::Sweep,
    };
    let result = run_pipeline(&mut state, terminal, &options, cli.verbose, |_, diags| {
        for d in diags {
            eprintln!("dfspec: {}", d);
        }
    });
    if let Err(e) = result {
        eprintln!("dfspec: error: {}", e);
        std::process::exit(1);
    }

    // ── Emit ──
    let program = match cli.emit {
        EmitStage::Unspecialized => state.unspecialized.as_ref(),
        _ => state.program.as_ref(),
    };
    let Some(program) = program else {
        eprintln!("dfspec: error: no program was produced");
        std::process::exit(1);
    };
    match cli.emit {
        EmitStage::Ir | EmitStage::Unspecialized => print!("{}", program),
        EmitStage::Summary => {
            println!("{}", state.summary);
            let warnings = state.diagnostics.iter().filter(|d| !d.is_error()).count();
            println!("warnings:             {}", warnings);
        }
        EmitStage::Fingerprint => match compute_provenance(&bundle, program) {
            Ok(p) => print!("{}", p.to_json()),
            Err(e) => {
                eprintln!("dfspec: error: {}", e);
                std::process::exit(1);
            }
        },
    }
}
