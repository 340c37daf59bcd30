use std::collections::HashSet;
use std::sync::Arc;

use crate::ast::Value;
use crate::namespaces::Var;
use crate::symbols::Symbol;
use crate::vm::bytecode::Label;

/// How a lexically bound symbol is reached from the code being compiled.
#[derive(Clone, Debug)]
pub(crate) enum Alias {
    /// Parameter slot of the enclosing fn.
    FnArgument(String),
    /// `let*`/`loop*` binding, stored under a unique local name.
    RenamedLocal(String),
    /// Outer binding reached through a closure cell.
    Closure(ClosureAlias),
    /// Name replaced by a form at each use.
    LocalMacro(Value),
    /// The var being defined, read through its `deref` method.
    SelfReference(Arc<Var>),
}

impl Alias {
    /// Aliases that denote a runtime value and can therefore be captured.
    pub(crate) fn is_capturable(&self) -> bool {
        matches!(
            self,
            Alias::FnArgument(_) | Alias::RenamedLocal(_) | Alias::Closure(_)
        )
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ClosureAlias {
    pub(crate) id: usize,
    /// Cell name, shared by the capturing store in the outer frame and the
    /// free variable of the inner code object.
    pub(crate) cell: String,
    pub(crate) source: CaptureSource,
}

#[derive(Clone, Debug)]
pub(crate) enum CaptureSource {
    /// Value of this alias in the enclosing scope, copied into a fresh cell.
    Outer(Box<Alias>),
    /// The fn's own name; the cell is filled once the closure exists.
    OwnName,
}

/// Captures offered to one fn body and the subset it referenced.
#[derive(Debug, Default)]
pub(crate) struct CaptureScope {
    pub(crate) offered: Vec<(Symbol, ClosureAlias)>,
    pub(crate) used: HashSet<usize>,
}

impl CaptureScope {
    pub(crate) fn offers(&self, id: usize) -> bool {
        self.offered.iter().any(|(_, alias)| alias.id == id)
    }

    /// Referenced captures, in offer order.
    pub(crate) fn into_used(self) -> (Vec<Symbol>, Vec<ClosureAlias>) {
        let CaptureScope { offered, used } = self;
        let syms = offered.iter().map(|(sym, _)| sym.clone()).collect();
        let captures = offered
            .into_iter()
            .filter(|(_, alias)| used.contains(&alias.id))
            .map(|(_, alias)| alias)
            .collect();
        (syms, captures)
    }
}

/// Target of `recur`: the jump-back label and the bindings it rebinds.
#[derive(Clone, Debug)]
pub(crate) struct RecurPoint {
    pub(crate) label: Label,
    pub(crate) targets: Vec<Alias>,
    /// `try` nesting depth when the point was established.
    pub(crate) try_depth: usize,
}
