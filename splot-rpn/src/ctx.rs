//! Variable contexts and compiled function binding.
//!
//! Contexts form a tree: variable reads walk up the parent chain, and
//! a set on any context notifies dependent functions bound in that
//! context and in every descendant, since those are the evaluations
//! that could observe the new value.
use crate::{eval::VarLookup, Program, Result};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use splot_value::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

#[derive(Debug, Clone)]
pub struct RpnContext(Arc<CtxInner>);

#[derive(Debug)]
struct CtxInner {
    parent: Option<RpnContext>,
    vars: Mutex<FxHashMap<ArcStr, Value>>,
    children: Mutex<Vec<Weak<CtxInner>>>,
    functions: Mutex<Vec<Weak<FunctionInner>>>,
}

impl Default for RpnContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RpnContext {
    pub fn new() -> Self {
        RpnContext(Arc::new(CtxInner {
            parent: None,
            vars: Mutex::new(FxHashMap::default()),
            children: Mutex::new(Vec::new()),
            functions: Mutex::new(Vec::new()),
        }))
    }

    /// Create a child context. Reads in the child see the parent's
    /// variables; sets in the child shadow them.
    pub fn child(&self) -> Self {
        let c = RpnContext(Arc::new(CtxInner {
            parent: Some(self.clone()),
            vars: Mutex::new(FxHashMap::default()),
            children: Mutex::new(Vec::new()),
            functions: Mutex::new(Vec::new()),
        }));
        let mut children = self.0.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(&c.0));
        c
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let mut cur = Some(self);
        while let Some(c) = cur {
            if let Some(v) = c.0.vars.lock().get(name) {
                return Some(v.clone());
            }
            cur = c.0.parent.as_ref();
        }
        None
    }

    /// Set a variable and notify every dependent compiled function
    /// bound here or below. Callbacks run after the variable store,
    /// outside the context locks.
    pub fn set(&self, name: impl Into<ArcStr>, v: Value) {
        let name = name.into();
        self.0.vars.lock().insert(name.clone(), v);
        let mut dependents = Vec::new();
        self.0.collect_dependents(&name, &mut dependents);
        for f in dependents {
            f.dirty.store(true, Ordering::Release);
            let cb = f.on_change.lock().clone();
            if let Some(cb) = cb {
                cb()
            }
        }
    }

    /// Set a variable without waking dependents. Used to seed inputs
    /// before an explicit evaluation.
    pub fn set_quiet(&self, name: impl Into<ArcStr>, v: Value) {
        self.0.vars.lock().insert(name.into(), v);
    }

    /// Bind a compiled program to this context. The returned function
    /// is notified whenever a variable it references is set here or
    /// in an ancestor of a context below it.
    pub fn bind(&self, program: Program) -> RpnFunction {
        let f = Arc::new(FunctionInner {
            program,
            ctx: self.clone(),
            dirty: AtomicBool::new(false),
            on_change: Mutex::new(None),
        });
        let mut functions = self.0.functions.lock();
        functions.retain(|w| w.strong_count() > 0);
        functions.push(Arc::downgrade(&f));
        RpnFunction(f)
    }
}

impl CtxInner {
    fn collect_dependents(&self, name: &str, out: &mut Vec<Arc<FunctionInner>>) {
        {
            let mut functions = self.functions.lock();
            functions.retain(|w| match w.upgrade() {
                None => false,
                Some(f) => {
                    if f.program.references(name) {
                        out.push(f);
                    }
                    true
                }
            });
        }
        let children = {
            let mut children = self.children.lock();
            children.retain(|w| w.strong_count() > 0);
            children.iter().filter_map(|w| w.upgrade()).collect::<Vec<_>>()
        };
        for c in children {
            c.collect_dependents(name, out)
        }
    }
}

impl VarLookup for RpnContext {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

/// A compiled program bound to a context.
#[derive(Debug, Clone)]
pub struct RpnFunction(Arc<FunctionInner>);

struct FunctionInner {
    program: Program,
    ctx: RpnContext,
    dirty: AtomicBool,
    on_change: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for FunctionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpnFunction({})", self.program.source())
    }
}

impl RpnFunction {
    pub fn program(&self) -> &Program {
        &self.0.program
    }

    pub fn context(&self) -> &RpnContext {
        &self.0.ctx
    }

    /// Install the change callback. It fires on the thread that set
    /// the variable; implementations are expected to schedule their
    /// real work rather than evaluate inline.
    pub fn set_on_change(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.0.on_change.lock() = Some(Arc::new(f));
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(Ordering::Acquire)
    }

    /// Evaluate against the bound context, clearing the dirty mark.
    pub fn call(&self) -> Result<Option<Value>> {
        self.0.dirty.store(false, Ordering::Release);
        self.0.program.eval(&self.0.ctx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parent_chain_reads() {
        let root = RpnContext::new();
        let child = root.child();
        root.set("x", Value::I64(10));
        child.set("y", Value::I64(5));
        let f = child.bind(compile("x y +").unwrap());
        assert_eq!(f.call().unwrap(), Some(Value::I64(15)));
        assert!(root.get("y").is_none());
    }

    #[test]
    fn dependents_notified_through_children() {
        let root = RpnContext::new();
        let child = root.child();
        child.set_quiet("v", Value::I64(1));
        let f = child.bind(compile("v 1 +").unwrap());
        let fired = Arc::new(AtomicUsize::new(0));
        let n = fired.clone();
        f.set_on_change(move || {
            n.fetch_add(1, Ordering::Relaxed);
        });
        // a set on the root reaches functions bound in the child
        root.set("v", Value::I64(2));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(f.is_dirty());
        assert_eq!(f.call().unwrap(), Some(Value::I64(2)));
        assert!(!f.is_dirty());
        // unrelated variables do not wake the function
        root.set("w", Value::I64(9));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropped_functions_are_pruned() {
        let root = RpnContext::new();
        let f = root.bind(compile("v").unwrap());
        drop(f);
        root.set("v", Value::I64(1));
    }
}
