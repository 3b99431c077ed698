// dfspec — dataflow actor-network specializer
//
// Library root. The IR toolkit (lexer → parser → lower → ir) comes first,
// then the actor graph and runtime library, then the specialization passes
// in pipeline order.

pub mod ast;
pub mod cfg;
pub mod cleanup;
pub mod diag;
pub mod error;
pub mod id;
pub mod inline;
pub mod ir;
pub mod lattice;
pub mod lexer;
pub mod library;
pub mod lower;
pub mod parser;

pub mod expr;
pub mod model;
pub mod schedule;

pub mod callsite;
pub mod dce;
pub mod inline_schedule;
pub mod resolve;
pub mod scaffold;
pub mod typeflow;
pub mod unbox;

pub mod exec;
pub mod pass;
pub mod pipeline;
