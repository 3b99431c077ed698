// pipeline.rs — Specialization state and pass orchestration
//
// Holds the inputs of one run (graph, schedules, library and user IR) and
// every pass artifact, and runs the minimal set of passes for a given
// terminal PassId. Each pass mutates the one `Program` in place.
//
// Preconditions: the state was built from a bundle (or its parts) whose IR parsed.
// Postconditions: artifacts for all required passes are populated, or has_error is set.
// Failure modes: a pass returning `SpecializeError`; error-level diagnostics;
//   a certificate obligation not met (E0601).
// Side effects: calls on_pass_complete after each pass; stderr timing lines
//   when verbose.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callsite::resolve_call_sites;
use crate::dce::{sweep, verify_sweep, Roots, SweepReport};
use crate::diag::{codes, DiagLevel, Diagnostic, Location};
use crate::error::{Result as SpecializeResult, SpecializeError};
use crate::inline_schedule::{inline, verify_lifecycle, ScheduleOptions};
use crate::ir::Program;
use crate::lattice::MAX_TYPE_DEPTH;
use crate::library::runtime_library;
use crate::lower::parse_ir;
use crate::model::{ActorGraph, EntitySpec};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::resolve::{resolve, verify_resolve, ConstantValueMap};
use crate::scaffold::{scaffold, verify_scaffold, Bindings};
use crate::schedule::ScheduleSet;
use crate::typeflow::TypeContext;
use crate::unbox::{unbox, verify_unbox, UnboxOptions};

// ── Configuration ──────────────────────────────────────────────────────────

/// Knobs of one specialization run.
#[derive(Debug, Clone)]
pub struct SpecializeOptions {
    /// Dataflow firings repeated fewer times than this are unrolled.
    pub threshold: u32,
    /// Bound on call-site inlining rounds (and unboxing rounds per depth).
    pub max_inline_rounds: usize,
    /// Deepest token nesting that unboxing considers.
    pub max_type_depth: usize,
    pub eliminate_dead_code: bool,
}

impl SpecializeOptions {
    /// `max_type_depth` bounded by the nesting the lattice tracks.
    pub fn type_depth(&self) -> usize {
        self.max_type_depth.min(MAX_TYPE_DEPTH)
    }
}

impl Default for SpecializeOptions {
    fn default() -> Self {
        SpecializeOptions {
            threshold: 2,
            max_inline_rounds: 20,
            max_type_depth: 4,
            eliminate_dead_code: true,
        }
    }
}

/// Everything one run consumes, as read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub graph: EntitySpec,
    #[serde(default)]
    pub schedules: ScheduleSet,
    /// Textual IR of the user actor classes.
    pub ir: String,
}

impl Bundle {
    pub fn from_json(text: &str) -> SpecializeResult<Bundle> {
        serde_json::from_str(text)
            .map_err(|e| SpecializeError::Parse(format!("bundle: {}", e)))
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducibility checks.
///
/// `input_hash`: SHA-256 of the bundle's canonical compact JSON.
/// `fingerprint`: SHA-256 of the printed output program.
/// `specializer_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub input_hash: [u8; 32],
    pub fingerprint: [u8; 32],
    pub specializer_version: &'static str,
}

impl Provenance {
    pub fn input_hash_hex(&self) -> String {
        bytes_to_hex(&self.input_hash)
    }

    pub fn fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit fingerprint`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"input_hash\": \"{}\",\n  \"fingerprint\": \"{}\",\n  \"specializer_version\": \"{}\"\n}}\n",
            self.input_hash_hex(),
            self.fingerprint_hex(),
            self.specializer_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(text: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// SHA-256 of the printed program, as hex.
pub fn fingerprint(program: &Program) -> String {
    bytes_to_hex(&sha256(&program.to_string()))
}

pub fn compute_provenance(bundle: &Bundle, program: &Program) -> SpecializeResult<Provenance> {
    let canonical = serde_json::to_string(bundle)
        .map_err(|e| SpecializeError::internal(format!("bundle does not serialize: {}", e)))?;
    Ok(Provenance {
        input_hash: sha256(&canonical),
        fingerprint: sha256(&program.to_string()),
        specializer_version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Run summary ────────────────────────────────────────────────────────────

/// Counts gathered while the passes ran, printed by `--emit summary`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub values_resolved: usize,
    pub composites_inlined: usize,
    pub accessors_rewritten: usize,
    pub calls_inlined: usize,
    pub inline_rounds: usize,
    pub values_unboxed: usize,
    pub sweep: Option<SweepReport>,
    pub classes: usize,
    pub methods: usize,
    pub statements: usize,
}

impl RunSummary {
    fn measure(&mut self, program: &Program) {
        self.classes = program.classes.len();
        self.methods = program.classes.values().map(|c| c.methods.len()).sum();
        self.statements = program
            .classes
            .values()
            .flat_map(|c| c.methods.iter())
            .map(|m| m.body.len())
            .sum();
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "values resolved:      {}", self.values_resolved)?;
        writeln!(f, "composites inlined:   {}", self.composites_inlined)?;
        writeln!(f, "accessors rewritten:  {}", self.accessors_rewritten)?;
        writeln!(
            f,
            "calls inlined:        {} ({} rounds)",
            self.calls_inlined, self.inline_rounds
        )?;
        writeln!(f, "values unboxed:       {}", self.values_unboxed)?;
        if let Some(s) = &self.sweep {
            writeln!(
                f,
                "removed:              {} methods, {} fields, {} lookups, {} classes",
                s.methods_removed, s.fields_removed, s.lookups_removed, s.classes_removed
            )?;
        }
        write!(
            f,
            "program:              {} classes, {} methods, {} statements",
            self.classes, self.methods, self.statements
        )
    }
}

// ── Specialization state ───────────────────────────────────────────────────

/// Inputs, artifacts and accumulated diagnostics of one run.
pub struct SpecializationState {
    pub graph: ActorGraph,
    pub schedules: ScheduleSet,
    pub library: Program,
    pub user: Program,
    pub program: Option<Program>,
    pub bindings: Option<Bindings>,
    pub values: Option<ConstantValueMap>,
    /// The scaffolded program before any specialization.
    pub unspecialized: Option<Program>,
    pub summary: RunSummary,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl SpecializationState {
    pub fn new(graph: ActorGraph, schedules: ScheduleSet, library: Program, user: Program) -> Self {
        Self {
            graph,
            schedules,
            library,
            user,
            program: None,
            bindings: None,
            values: None,
            unspecialized: None,
            summary: RunSummary::default(),
            diagnostics: Vec::new(),
            has_error: false,
        }
    }

    /// Build the graph, load the runtime library and parse the user IR.
    pub fn from_bundle(bundle: &Bundle) -> SpecializeResult<Self> {
        let graph = ActorGraph::from_spec(&bundle.graph)?;
        let library = runtime_library()?;
        let user = parse_ir(&bundle.ir, &library)?;
        Ok(Self::new(graph, bundle.schedules.clone(), library, user))
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution stopped in a pass. Error-level diagnostics, if any,
/// are in `SpecializationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_pass: PassId,
    /// Set when the pass aborted with a fatal error.
    pub error: Option<SpecializeError>,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = descriptor(self.failing_pass).name;
        match &self.error {
            Some(e) => write!(f, "{} failed: {}", name, e),
            None => write!(f, "{} reported errors", name),
        }
    }
}

impl std::error::Error for PipelineError {}

// ── Helpers ────────────────────────────────────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

fn fatal(pass_id: PassId) -> impl FnOnce(SpecializeError) -> PipelineError {
    move |error| PipelineError {
        failing_pass: pass_id,
        error: Some(error),
    }
}

fn missing(pass_id: PassId, what: &str) -> PipelineError {
    PipelineError {
        failing_pass: pass_id,
        error: Some(SpecializeError::internal(format!(
            "{} needs {} from an earlier pass",
            descriptor(pass_id).name,
            what
        ))),
    }
}

/// Turn a failed certificate into an E0601 diagnostic.
fn check_cert(pass_id: PassId, cert: &impl StageCert, diags: &mut Vec<Diagnostic>) {
    if cert.all_pass() {
        return;
    }
    diags.push(
        Diagnostic::new(
            DiagLevel::Error,
            Location::default(),
            format!(
                "{} verification failed: {}",
                descriptor(pass_id).name,
                cert.failed().join(", ")
            ),
        )
        .with_code(codes::E0601),
    );
}

/// Per-pass post-processing: callback, accumulate, log, error check.
fn finish_pass(
    state: &mut SpecializationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let name = descriptor(pass_id).name;
    debug!(pass = name, diagnostics = diags.len(), "diagnostics reported");
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    let ms = elapsed.as_secs_f64() * 1000.0;
    debug!(pass = name, ms, "pass complete");
    if verbose {
        eprintln!("dfspec: {} complete, {:.1}ms", name, ms);
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
            error: None,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → certificate → on_pass_complete → verbose →
/// error check. A fatal error sets `has_error` and returns immediately.
pub fn run_pipeline(
    state: &mut SpecializationState,
    terminal: PassId,
    options: &SpecializeOptions,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        if pass_id == PassId::Sweep && !options.eliminate_dead_code {
            continue;
        }
        let t = Instant::now();
        let outcome = run_pass(state, pass_id, options);
        let elapsed = t.elapsed();
        match outcome {
            Ok(diags) => finish_pass(
                state,
                pass_id,
                diags,
                elapsed,
                verbose,
                &mut on_pass_complete,
            )?,
            Err(e) => {
                state.has_error = true;
                return Err(e);
            }
        }
    }
    if let Some(program) = &state.program {
        state.summary.measure(program);
    }
    Ok(())
}

fn run_pass(
    state: &mut SpecializationState,
    pass_id: PassId,
    options: &SpecializeOptions,
) -> Result<Vec<Diagnostic>, PipelineError> {
    let mut diags = Vec::new();
    match pass_id {
        PassId::Scaffold => {
            let (program, bindings) =
                scaffold(&state.graph, &state.library, &state.user).map_err(fatal(pass_id))?;
            let cert = verify_scaffold(&state.graph, &program, &bindings);
            check_cert(pass_id, &cert, &mut diags);
            state.unspecialized = Some(program.clone());
            state.program = Some(program);
            state.bindings = Some(bindings);
        }
        PassId::Resolve => {
            let program = state.program.as_mut().ok_or_else(|| missing(pass_id, "a program"))?;
            let bindings = state.bindings.as_ref().ok_or_else(|| missing(pass_id, "bindings"))?;
            let result = resolve(&state.graph, program, bindings).map_err(fatal(pass_id))?;
            let cert = verify_resolve(&state.graph, program, &result.values);
            diags.extend(result.diagnostics);
            check_cert(pass_id, &cert, &mut diags);
            state.summary.values_resolved = result.values.len();
            state.values = Some(result.values);
        }
        PassId::InlineSchedule => {
            let program = state.program.as_mut().ok_or_else(|| missing(pass_id, "a program"))?;
            let bindings = state.bindings.as_ref().ok_or_else(|| missing(pass_id, "bindings"))?;
            let values = state.values.as_ref().ok_or_else(|| missing(pass_id, "values"))?;
            let schedule_options = ScheduleOptions {
                threshold: options.threshold,
            };
            let n = inline(
                &state.graph,
                program,
                bindings,
                &state.schedules,
                values,
                schedule_options,
            )
            .map_err(fatal(pass_id))?;
            let cert = verify_lifecycle(&state.graph, program, bindings, &state.schedules);
            check_cert(pass_id, &cert, &mut diags);
            state.summary.composites_inlined = n;
        }
        PassId::InlineCalls => {
            let program = state.program.as_mut().ok_or_else(|| missing(pass_id, "a program"))?;
            let bindings = state.bindings.as_ref().ok_or_else(|| missing(pass_id, "bindings"))?;
            let values = state.values.as_ref().ok_or_else(|| missing(pass_id, "values"))?;
            let ctx = TypeContext::new(&state.graph, bindings, values);
            let report = resolve_call_sites(
                program,
                &state.graph,
                bindings,
                values,
                &ctx,
                options.max_inline_rounds,
            )
            .map_err(fatal(pass_id))?;
            state.summary.accessors_rewritten = report.accessors;
            state.summary.calls_inlined = report.inlined + report.notifications;
            state.summary.inline_rounds = report.rounds;
            diags.extend(report.diagnostics);
        }
        PassId::Unbox => {
            let program = state.program.as_mut().ok_or_else(|| missing(pass_id, "a program"))?;
            let bindings = state.bindings.as_ref().ok_or_else(|| missing(pass_id, "bindings"))?;
            let values = state.values.as_ref().ok_or_else(|| missing(pass_id, "values"))?;
            let ctx = TypeContext::new(&state.graph, bindings, values);
            if options.max_type_depth > MAX_TYPE_DEPTH {
                diags.push(
                    Diagnostic::warning(
                        codes::W0305,
                        Location::class(bindings.class_of(state.graph.root())),
                        format!(
                            "max type depth {} exceeds the lattice bound; using {}",
                            options.max_type_depth, MAX_TYPE_DEPTH
                        ),
                    )
                    .with_hint("deeper token nesting is tracked as a general token"),
                );
            }
            let unbox_options = UnboxOptions {
                max_depth: options.type_depth(),
                max_rounds: options.max_inline_rounds,
            };
            let report = unbox(program, bindings.generated_classes(), &ctx, unbox_options)
                .map_err(fatal(pass_id))?;
            let cert = verify_unbox(program, &report.replacements);
            diags.extend(report.diagnostics);
            check_cert(pass_id, &cert, &mut diags);
            state.summary.values_unboxed = report.unboxed;
            state.summary.calls_inlined += report.inlined;
        }
        PassId::Sweep => {
            let program = state.program.as_mut().ok_or_else(|| missing(pass_id, "a program"))?;
            let bindings = state.bindings.as_ref().ok_or_else(|| missing(pass_id, "bindings"))?;
            let roots = Roots {
                top: bindings.class_of(state.graph.root()).to_string(),
                entities: bindings.generated_classes().to_vec(),
            };
            let report = sweep(program, &roots).map_err(fatal(pass_id))?;
            let cert = verify_sweep(program, &roots);
            check_cert(pass_id, &cert, &mut diags);
            state.summary.sweep = Some(report);
        }
    }
    Ok(diags)
}

// ── Convenience entry point ────────────────────────────────────────────────

/// Run every pass on a bundle. Error diagnostics become a fatal error
/// naming the first of them.
pub fn specialize(
    bundle: &Bundle,
    options: &SpecializeOptions,
) -> SpecializeResult<SpecializationState> {
    let mut state = SpecializationState::from_bundle(bundle)?;
    match run_pipeline(&mut state, PassId::Sweep, options, false, |_, _| {}) {
        Ok(()) => Ok(state),
        Err(PipelineError {
            error: Some(e), ..
        }) => Err(e),
        Err(err) => {
            let first = state
                .diagnostics
                .iter()
                .find(|d| d.is_error())
                .map(|d| d.to_string())
                .unwrap_or_default();
            Err(SpecializeError::internal(format!("{}: {}", err, first)))
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
