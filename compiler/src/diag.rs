// diag.rs — Unified diagnostics model
//
// Non-fatal conditions found by any pass (ambiguous dispatch, inline bound
// reached, unsafe values, dynamic attributes) are reported as `Diagnostic`s
// and accumulated by the pipeline. Fatal conditions use `SpecializeError`
// instead (see error.rs).
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `W0301`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered diagnostic codes.
pub mod codes {
    use super::DiagCode;

    /// A virtual call has more than one candidate implementation.
    pub const W0301: DiagCode = DiagCode("W0301");
    /// Call-site inlining stopped at the round bound.
    pub const W0302: DiagCode = DiagCode("W0302");
    /// A boxed value was excluded from unboxing.
    pub const W0303: DiagCode = DiagCode("W0303");
    /// An attribute expression could not be folded to a constant.
    pub const W0304: DiagCode = DiagCode("W0304");
    /// An option was clamped to the range the analysis supports.
    pub const W0305: DiagCode = DiagCode("W0305");
    /// A pass certificate did not hold.
    pub const E0601: DiagCode = DiagCode("E0601");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Location ─────────────────────────────────────────────────────────────

/// Where in the program a diagnostic applies.
///
/// Specialization works on IR rather than on source text, so locations are
/// (class, method, statement index) triples. Graph-level diagnostics carry
/// only the class of the owning entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub class: String,
    pub method: Option<String>,
    pub stmt: Option<usize>,
}

impl Location {
    pub fn class(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: None,
            stmt: None,
        }
    }

    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: Some(method.into()),
            stmt: None,
        }
    }

    pub fn stmt(class: impl Into<String>, method: impl Into<String>, stmt: usize) -> Self {
        Self {
            class: class.into(),
            method: Some(method.into()),
            stmt: Some(stmt),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class)?;
        if let Some(m) = &self.method {
            write!(f, "::{}", m)?;
        }
        if let Some(s) = self.stmt {
            write!(f, "@{}", s)?;
        }
        Ok(())
    }
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining why a value or call was rejected.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub location: Option<Location>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub location: Location,
    pub message: String,
    pub hint: Option<String>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or causes.
    pub fn new(level: DiagLevel, location: Location, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            location,
            message: message.into(),
            hint: None,
            cause_chain: Vec::new(),
        }
    }

    /// Shorthand for a warning with a code.
    pub fn warning(code: DiagCode, location: Location, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, location, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, location: Option<Location>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            location,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}: {}", level, code, self.location, self.message)?;
        } else {
            write!(f, "{}: {}: {}", level, self.location, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
