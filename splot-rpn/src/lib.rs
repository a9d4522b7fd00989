//! The splot RPN expression engine
//!
//! Automations (pairings, timers, rules) carry small Forth-like
//! programs: whitespace separated tokens evaluated over a value
//! stack. A program is compiled once into an operation tree, which
//! records every variable it references; compiled functions bound to
//! a context are notified when one of their variables changes, which
//! is how pairings and rules know to re-run.
//!
//! Programs are total: compilation rejects unknown tokens, evaluation
//! rejects type mismatches, and loops are iteration capped.
use arcstr::ArcStr;
use thiserror::Error;

mod compile;
mod ctx;
mod eval;
mod op;
#[cfg(test)]
mod test;

pub use compile::compile;
pub use ctx::{RpnContext, RpnFunction};
pub use eval::VarLookup;

use fxhash::FxHashSet;
use splot_value::CastError;
use triomphe::Arc;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpnError {
    #[error("syntax error: {0}")]
    Syntax(ArcStr),
    #[error("unknown variable {0}")]
    UnknownVariable(ArcStr),
    #[error("value error: {0}")]
    Value(ArcStr),
}

impl From<CastError> for RpnError {
    fn from(e: CastError) -> Self {
        RpnError::Value(ArcStr::from(e.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, RpnError>;

/// A compiled RPN program.
///
/// Cloning is cheap; the operation tree and the referenced variable
/// set are shared.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) ops: Arc<Vec<op::Op>>,
    pub(crate) vars: Arc<FxHashSet<ArcStr>>,
    src: ArcStr,
}

impl Program {
    /// The source text the program was compiled from.
    pub fn source(&self) -> &ArcStr {
        &self.src
    }

    /// Whether compilation recorded a reference to `name`.
    pub fn references(&self, name: &str) -> bool {
        self.vars.contains(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &ArcStr> {
        self.vars.iter()
    }
}
