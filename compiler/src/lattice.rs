// lattice.rs — Token type lattice
//
// Partial order over the shapes a boxed value (token) can take:
//
//                    General
//                  /    |     \
//             String  Array(..) ...
//            /     \
//       Boolean   Scalar
//                /      \
//             Long     Double
//                \      /
//                  Int
//                   |
//                Unknown
//
// `Array(a) <= Array(b)` iff `a <= b`; arrays are incomparable with scalars.
// Nesting is bounded: building an array type deeper than `MAX_TYPE_DEPTH`
// yields `General`, which keeps every chain finite.
//
// Preconditions: none.
// Postconditions: `compare` and `least_upper_bound` are total.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::IrType;

/// Upper bound on array nesting tracked by the lattice.
pub const MAX_TYPE_DEPTH: usize = 4;

/// A point in the token type lattice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Bottom: nothing known yet. Identity of `least_upper_bound`.
    Unknown,
    Boolean,
    Int,
    Long,
    Double,
    /// Abstract numeric supertype; not instantiable.
    Scalar,
    String,
    Array(Box<TokenType>),
    /// Top: any token.
    General,
}

/// Result of comparing two lattice elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRelation {
    Same,
    Lower,
    Higher,
    Incomparable,
}

impl TokenType {
    /// Array of `elem`, collapsing to `General` past the depth bound.
    pub fn array_of(elem: TokenType) -> TokenType {
        if elem.depth() + 1 > MAX_TYPE_DEPTH {
            TokenType::General
        } else {
            TokenType::Array(Box::new(elem))
        }
    }

    /// Number of container levels: scalars are 0, `Array(Double)` is 1.
    pub fn depth(&self) -> usize {
        match self {
            TokenType::Array(e) => 1 + e.depth(),
            _ => 0,
        }
    }

    /// Whether a value of exactly this type can be constructed.
    pub fn is_instantiable(&self) -> bool {
        match self {
            TokenType::Boolean
            | TokenType::Int
            | TokenType::Long
            | TokenType::Double
            | TokenType::String => true,
            TokenType::Array(e) => e.is_instantiable(),
            TokenType::Unknown | TokenType::Scalar | TokenType::General => false,
        }
    }

    pub fn element(&self) -> Option<&TokenType> {
        match self {
            TokenType::Array(e) => Some(e),
            _ => None,
        }
    }

    /// Name of the library class implementing this type, if any.
    pub fn token_class(&self) -> Option<&'static str> {
        match self {
            TokenType::Unknown => None,
            TokenType::Boolean => Some("BooleanToken"),
            TokenType::Int => Some("IntToken"),
            TokenType::Long => Some("LongToken"),
            TokenType::Double => Some("DoubleToken"),
            TokenType::Scalar => Some("ScalarToken"),
            TokenType::String => Some("StringToken"),
            TokenType::Array(_) => Some("ArrayToken"),
            TokenType::General => Some("Token"),
        }
    }

    /// Lattice type implied by a token class name. `ArrayToken` maps to
    /// `Array(General)` since the class does not fix its element type.
    pub fn from_token_class(name: &str) -> Option<TokenType> {
        match name {
            "Token" => Some(TokenType::General),
            "BooleanToken" => Some(TokenType::Boolean),
            "IntToken" => Some(TokenType::Int),
            "LongToken" => Some(TokenType::Long),
            "DoubleToken" => Some(TokenType::Double),
            "ScalarToken" => Some(TokenType::Scalar),
            "StringToken" => Some(TokenType::String),
            "ArrayToken" => Some(TokenType::array_of(TokenType::General)),
            _ => None,
        }
    }

    /// Lattice type of a statically declared IR type. Arrays of tokens map
    /// to their element type, matching how the analysis tracks them.
    pub fn from_ir_type(ty: &IrType) -> Option<TokenType> {
        match ty {
            IrType::Object(name) => TokenType::from_token_class(name),
            IrType::Array(elem) => TokenType::from_ir_type(elem),
            _ => None,
        }
    }

    /// Native IR type storing a primitive of this scalar type.
    pub fn native_type(&self) -> Option<IrType> {
        match self {
            TokenType::Boolean => Some(IrType::Bool),
            TokenType::Int => Some(IrType::Int),
            TokenType::Long => Some(IrType::Long),
            TokenType::Double => Some(IrType::Double),
            TokenType::String => Some(IrType::Str),
            _ => None,
        }
    }

    /// Immediate supertypes among the scalar kinds.
    fn parents(&self) -> Vec<TokenType> {
        match self {
            TokenType::Unknown | TokenType::General => Vec::new(),
            TokenType::Boolean => vec![TokenType::String],
            TokenType::Int => vec![TokenType::Long, TokenType::Double],
            TokenType::Long | TokenType::Double => vec![TokenType::Scalar],
            TokenType::Scalar => vec![TokenType::String],
            TokenType::String | TokenType::Array(_) => vec![TokenType::General],
        }
    }

    /// Reflexive-transitive upward closure of a scalar kind.
    fn upper_set(&self) -> Vec<TokenType> {
        let mut out = vec![self.clone()];
        let mut i = 0;
        while i < out.len() {
            for p in out[i].parents() {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
            i += 1;
        }
        out
    }

    /// `self <= other` in the lattice order.
    pub fn leq(&self, other: &TokenType) -> bool {
        match (self, other) {
            (TokenType::Unknown, _) => true,
            (_, TokenType::General) => true,
            (TokenType::General, _) => false,
            (_, TokenType::Unknown) => false,
            (TokenType::Array(a), TokenType::Array(b)) => a.leq(b),
            (TokenType::Array(_), _) | (_, TokenType::Array(_)) => false,
            (a, b) => a.upper_set().contains(b),
        }
    }
}

/// Compare two lattice elements.
pub fn compare(a: &TokenType, b: &TokenType) -> TypeRelation {
    match (a.leq(b), b.leq(a)) {
        (true, true) => TypeRelation::Same,
        (true, false) => TypeRelation::Lower,
        (false, true) => TypeRelation::Higher,
        (false, false) => TypeRelation::Incomparable,
    }
}

/// Least upper bound of two lattice elements.
pub fn least_upper_bound(a: &TokenType, b: &TokenType) -> TokenType {
    if a.leq(b) {
        return b.clone();
    }
    if b.leq(a) {
        return a.clone();
    }
    match (a, b) {
        (TokenType::Array(x), TokenType::Array(y)) => {
            TokenType::array_of(least_upper_bound(x, y))
        }
        (TokenType::Array(_), _) | (_, TokenType::Array(_)) => TokenType::General,
        _ => {
            let ua = a.upper_set();
            let ub = b.upper_set();
            let common: Vec<TokenType> = ua.into_iter().filter(|t| ub.contains(t)).collect();
            common
                .iter()
                .find(|cand| common.iter().all(|other| cand.leq(other)))
                .cloned()
                .unwrap_or(TokenType::General)
        }
    }
}

/// Merge of two optional facts; an absent fact behaves as `Unknown`.
pub fn merge(a: Option<&TokenType>, b: Option<&TokenType>) -> TokenType {
    match (a, b) {
        (Some(x), Some(y)) => least_upper_bound(x, y),
        (Some(x), None) | (None, Some(x)) => x.clone(),
        (None, None) => TokenType::Unknown,
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Unknown => write!(f, "unknown"),
            TokenType::Boolean => write!(f, "boolean"),
            TokenType::Int => write!(f, "int"),
            TokenType::Long => write!(f, "long"),
            TokenType::Double => write!(f, "double"),
            TokenType::Scalar => write!(f, "scalar"),
            TokenType::String => write!(f, "string"),
            TokenType::Array(e) => write!(f, "{{{}}}", e),
            TokenType::General => write!(f, "general"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(t: TokenType) -> TokenType {
        TokenType::array_of(t)
    }

    #[test]
    fn scalar_chain() {
        assert_eq!(compare(&TokenType::Int, &TokenType::Double), TypeRelation::Lower);
        assert_eq!(compare(&TokenType::Double, &TokenType::Int), TypeRelation::Higher);
        assert_eq!(
            compare(&TokenType::Long, &TokenType::Double),
            TypeRelation::Incomparable
        );
        assert_eq!(compare(&TokenType::String, &TokenType::String), TypeRelation::Same);
    }

    #[test]
    fn lub_of_siblings_is_common_parent() {
        assert_eq!(
            least_upper_bound(&TokenType::Long, &TokenType::Double),
            TokenType::Scalar
        );
        assert_eq!(
            least_upper_bound(&TokenType::Boolean, &TokenType::Int),
            TokenType::String
        );
    }

    #[test]
    fn lub_of_arrays_is_elementwise() {
        assert_eq!(
            least_upper_bound(&arr(TokenType::Int), &arr(TokenType::Double)),
            arr(TokenType::Double)
        );
        assert_eq!(
            least_upper_bound(&arr(TokenType::Int), &TokenType::Int),
            TokenType::General
        );
    }

    #[test]
    fn unknown_is_merge_identity() {
        for t in [
            TokenType::Boolean,
            TokenType::Double,
            arr(TokenType::Long),
            TokenType::General,
        ] {
            assert_eq!(least_upper_bound(&TokenType::Unknown, &t), t);
            assert_eq!(merge(None, Some(&t)), t);
        }
    }

    #[test]
    fn depth_is_bounded() {
        let mut t = TokenType::Double;
        for _ in 0..MAX_TYPE_DEPTH {
            t = arr(t);
        }
        assert_eq!(t.depth(), MAX_TYPE_DEPTH);
        assert_eq!(arr(t), TokenType::General);
    }

    #[test]
    fn instantiable_kinds() {
        assert!(TokenType::Double.is_instantiable());
        assert!(arr(TokenType::Int).is_instantiable());
        assert!(!arr(TokenType::Scalar).is_instantiable());
        assert!(!TokenType::General.is_instantiable());
        assert!(!TokenType::Unknown.is_instantiable());
    }

    #[test]
    fn class_mapping() {
        assert_eq!(TokenType::Double.token_class(), Some("DoubleToken"));
        assert_eq!(
            TokenType::from_token_class("ArrayToken"),
            Some(arr(TokenType::General))
        );
        assert_eq!(
            TokenType::from_ir_type(&IrType::Array(Box::new(IrType::Object(
                "DoubleToken".into()
            )))),
            Some(TokenType::Double)
        );
    }
}
