//! Rules: condition evaluated action lists.
//!
//! Each condition pairs a source URI with an RPN predicate over `v`,
//! the source's latest value. Whenever any source changes the whole
//! condition list re-evaluates under the configured match mode, and
//! the action list fires exactly once per satisfied edge.
use crate::{
    action::{ActionsTrait, TrapSink},
    manager::{ChildReaper, ManagedChild},
};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use splot_core::{
    deferred,
    dispatch::{ArgMap, PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    link::{Observation, ResourceLink},
    thing::{
        ArcThing, ChildCallback, ListenerHandle, PropertyBatch, PropertyCallback,
        SectionCallback, SectionMap, Snapshot,
    },
    Deferred, Error, Exec, Host, LocalThing, Modifier, PropertyKey, Result, SectionKind,
    Thing, Value, WeakHost,
};
use splot_rpn::{compile, Program};
use std::{
    fmt,
    sync::{Arc, Weak},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    All,
    Any,
}

struct Condition {
    uri: ArcStr,
    program: Program,
    link: Option<Arc<dyn ResourceLink>>,
    obs: Option<Observation>,
    last: Option<Value>,
}

struct RuleState {
    enabled: bool,
    mode: MatchMode,
    conditions: Vec<Condition>,
    satisfied: bool,
    count: i64,
    trap: Option<ArcStr>,
    owner: Option<(ArcStr, Weak<dyn ChildReaper>)>,
}

pub struct LocalRule {
    me: Weak<LocalRule>,
    base: Arc<LocalThing>,
    host: Mutex<WeakHost>,
    rule_trait: Arc<RuleTrait>,
    acti: Arc<ActionsTrait>,
    state: Mutex<RuleState>,
}

impl fmt::Debug for LocalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalRule({})", self.base.uid())
    }
}

impl LocalRule {
    pub fn new(
        uid: impl Into<ArcStr>,
        host: WeakHost,
        exec: Option<Exec>,
    ) -> Arc<LocalRule> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<LocalRule>| {
            let rule_trait = Arc::new(RuleTrait::new(me.clone()));
            let acti = Arc::new(ActionsTrait::new());
            let mut b = LocalThing::builder()
                .uid(uid)
                .with_trait(rule_trait.clone())
                .with_trait(acti.clone());
            if let Some(exec) = exec {
                b = b.executor(exec);
            }
            LocalRule {
                me: me.clone(),
                base: b.build(),
                host: Mutex::new(host),
                rule_trait,
                acti,
                state: Mutex::new(RuleState {
                    enabled: false,
                    mode: MatchMode::All,
                    conditions: Vec::new(),
                    satisfied: false,
                    count: 0,
                    trap: None,
                    owner: None,
                }),
            }
        })
    }

    pub fn base(&self) -> &Arc<LocalThing> {
        &self.base
    }

    pub fn count(&self) -> i64 {
        self.state.lock().count
    }

    fn set_conditions(&self, conds: Vec<(ArcStr, Program)>) {
        {
            let mut st = self.state.lock();
            st.conditions = conds
                .into_iter()
                .map(|(uri, program)| Condition {
                    uri,
                    program,
                    link: None,
                    obs: None,
                    last: None,
                })
                .collect();
            st.satisfied = false;
        }
        self.rewire()
    }

    /// Resolve condition links and attach observers when enabled.
    fn rewire(&self) {
        let host = self.host.lock().upgrade();
        let exec = self.base.executor();
        let mut st = self.state.lock();
        let enabled = st.enabled;
        for (i, c) in st.conditions.iter_mut().enumerate() {
            c.obs = None;
            if !enabled {
                continue;
            }
            let host = match &host {
                None => continue,
                Some(h) => h,
            };
            if c.link.is_none() {
                match host.link(&c.uri) {
                    Ok(l) => c.link = Some(l),
                    Err(e) => {
                        log::warn!("{}: condition {i}: {e}", self.base.uid());
                        continue;
                    }
                }
            }
            if let Some(l) = &c.link {
                let weak = self.me.clone();
                match l.observe(
                    exec.clone(),
                    Arc::new(move |v: &Value| {
                        if let Some(r) = weak.upgrade() {
                            r.on_condition_value(i, v.clone())
                        }
                    }),
                ) {
                    Ok(o) => c.obs = Some(o),
                    Err(e) => log::warn!("{}: observe {i}: {e}", self.base.uid()),
                }
            }
        }
    }

    fn on_condition_value(&self, index: usize, v: Value) {
        let fire = {
            let mut st = self.state.lock();
            if !st.enabled {
                return;
            }
            match st.conditions.get_mut(index) {
                None => return,
                Some(c) => c.last = Some(v),
            }
            let mut trap = None;
            let uid = self.base.uid().clone();
            let results = st.conditions.iter().map(|c| match &c.last {
                None => false,
                Some(v) => {
                    let mut vars = FxHashMap::default();
                    vars.insert(arcstr::literal!("v"), v.clone());
                    match c.program.eval(&vars) {
                        Ok(Some(out)) => out.cast_bool().unwrap_or(false),
                        Ok(None) => false,
                        Err(e) => {
                            log::warn!("{uid}: condition failed: {e}");
                            trap = Some(ArcStr::from(Error::from(e).token()));
                            false
                        }
                    }
                }
            });
            let satisfied = match st.mode {
                MatchMode::All => {
                    let mut any = false;
                    let mut all = true;
                    for r in results {
                        any = true;
                        all &= r;
                    }
                    any && all
                }
                MatchMode::Any => results.into_iter().any(|r| r),
            };
            if let Some(t) = trap {
                st.trap = Some(t);
            }
            // actions fire exactly once per satisfied edge
            let edge = satisfied && !st.satisfied;
            st.satisfied = satisfied;
            if edge {
                st.count += 1;
            }
            edge.then_some(st.count)
        };
        if let Some(count) = fire {
            self.rule_trait.announce("s/rule/c", Value::I64(count));
            let actions = self.acti.actions();
            if !actions.is_empty() {
                let host = self.host.lock().clone();
                let weak = self.me.clone();
                let sink: TrapSink = Arc::new(move |t| {
                    if let Some(r) = weak.upgrade() {
                        r.set_trap(t)
                    }
                });
                actions.dispatch(host, &self.base.executor(), sink);
            }
        }
    }

    fn set_trap(&self, trap: Option<ArcStr>) {
        let changed = {
            let mut st = self.state.lock();
            let changed = st.trap != trap;
            st.trap = trap.clone();
            changed
        };
        if changed {
            self.rule_trait
                .announce("m/rule/trap", trap.map(Value::String).unwrap_or(Value::Null))
        }
    }

    fn set_enabled(&self, enabled: bool) {
        {
            let mut st = self.state.lock();
            st.enabled = enabled;
            if !enabled {
                st.satisfied = false;
            }
        }
        self.rewire()
    }
}

impl Thing for LocalRule {
    fn uid(&self) -> ArcStr {
        self.base.uid().clone()
    }

    fn local(&self) -> Option<&LocalThing> {
        Some(&self.base)
    }

    fn set_property(&self, name: &str, value: Value, mods: &[Modifier]) -> Deferred<()> {
        deferred(self.base.set_property_now(name, value, mods))
    }

    fn fetch_property(&self, name: &str, mods: &[Modifier]) -> Deferred<Value> {
        deferred(self.base.fetch_property_now(name, mods))
    }

    fn fetch_section(&self, section: SectionKind, mods: &[Modifier]) -> Deferred<SectionMap> {
        deferred(Ok(self.base.fetch_section_now(section, mods)))
    }

    fn apply_properties(&self, props: PropertyBatch, mods: &[Modifier]) -> Deferred<()> {
        deferred(self.base.apply_properties_now(props, mods))
    }

    fn invoke_method(&self, name: &str, args: ArgMap) -> Deferred<Value> {
        deferred(self.base.invoke_now(name, &args))
    }

    fn register_property_listener(
        &self,
        exec: Exec,
        cb: PropertyCallback,
    ) -> Result<ListenerHandle> {
        Ok(self.base.register_property_listener_now(exec, cb))
    }

    fn register_section_listener(
        &self,
        section: SectionKind,
        exec: Exec,
        cb: SectionCallback,
    ) -> Result<ListenerHandle> {
        Ok(self.base.register_section_listener_now(section, exec, cb))
    }

    fn register_child_listener(
        &self,
        exec: Exec,
        cb: ChildCallback,
    ) -> Result<ListenerHandle> {
        Ok(self.base.register_child_listener_now(exec, cb))
    }

    fn copy_persistent_state(&self) -> Snapshot {
        self.base.copy_persistent_state_now()
    }

    fn init_with_persistent_state(&self, snap: Snapshot) -> Result<()> {
        self.base.init_with_persistent_state_now(snap)
    }

    fn attached(&self, host: &Host, _index: u32) {
        *self.host.lock() = host.downgrade();
        self.rewire()
    }

    fn detached(&self) {
        let mut st = self.state.lock();
        for c in st.conditions.iter_mut() {
            c.obs = None;
            c.link = None;
        }
    }
}

impl ManagedChild for LocalRule {
    const SHORT: &'static str = "rule";

    fn create(host: WeakHost, exec: Exec, uid: ArcStr) -> Arc<Self> {
        LocalRule::new(uid, host, Some(exec))
    }

    fn set_owner(&self, id: ArcStr, reaper: Weak<dyn ChildReaper>) {
        self.state.lock().owner = Some((id, reaper));
    }

    fn as_thing(self: Arc<Self>) -> ArcThing {
        self
    }
}

#[derive(Debug)]
pub struct RuleTrait {
    rule: Weak<LocalRule>,
    store: StoredTrait,
}

impl RuleTrait {
    fn new(rule: Weak<LocalRule>) -> Self {
        RuleTrait {
            rule,
            store: StoredTrait::with_values(
                splot_core::propdefs![
                    (Config, "rule", "cond", Array, Get | Set),
                    (Config, "rule", "mtch", String, Get | Set),
                    (Config, "rule", "enab", Bool, Get | Set),
                    (State, "rule", "c", Int, Get | Set | Reset | NoTrans),
                    (Metadata, "rule", "trap", String, Get | Volatile),
                ],
                [(arcstr::literal!("c/rule/mtch"), Value::from("all"))],
            ),
        }
    }

    fn announce(&self, name: &str, value: Value) {
        if let Some(k) = self.store.key_of(name) {
            let k = k.clone();
            self.store.store_and_announce(&k, value)
        }
    }

    fn rule(&self, key: &PropertyKey) -> Result<Arc<LocalRule>> {
        self.rule
            .upgrade()
            .ok_or_else(|| Error::BadStateForPropertyValue(key.name().clone()))
    }
}

impl ThingTrait for RuleTrait {
    fn name(&self) -> &'static str {
        "Rule"
    }

    fn short_id(&self) -> &'static str {
        "rule"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:rule"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.def(key)?;
        let r = self.rule(key)?;
        let st = r.state.lock();
        let v = match key.leaf().as_str() {
            "c" => Value::I64(st.count),
            "trap" => st.trap.clone().map(Value::String).unwrap_or(Value::Null),
            _ => {
                drop(st);
                return self.store.raw_get(key);
            }
        };
        Ok(v)
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        let r = self.rule(key)?;
        match key.leaf().as_str() {
            "cond" => {
                let conds = parse_conditions(key, &value)?;
                self.store.raw_set(key, value)?;
                r.set_conditions(conds);
                Ok(())
            }
            "mtch" => {
                let mode = match value.cast_str().as_deref() {
                    Ok("all") => MatchMode::All,
                    Ok("any") => MatchMode::Any,
                    _ => return Err(Error::InvalidPropertyValue(key.name().clone())),
                };
                self.store.raw_set(key, value)?;
                r.state.lock().mode = mode;
                Ok(())
            }
            "enab" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                r.set_enabled(b);
                Ok(())
            }
            "c" => {
                let n = value
                    .cast_i64()
                    .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
                self.store.raw_set(key, value)?;
                r.state.lock().count = n;
                Ok(())
            }
            _ => self.store.raw_set(key, value),
        }
    }
}

/// Conditions are stored as an array of maps with keys `u` (source
/// URI) and `p` (predicate program over `v`). Compile errors surface
/// here, at assignment time.
fn parse_conditions(key: &PropertyKey, value: &Value) -> Result<Vec<(ArcStr, Program)>> {
    let bad = || Error::InvalidPropertyValue(key.name().clone());
    let arr = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(a) => a.clone(),
        _ => return Err(bad()),
    };
    let mut out = Vec::with_capacity(arr.len());
    for e in arr.iter() {
        let m = e.cast_map().map_err(|_| bad())?;
        let uri = m.get("u").and_then(|v| v.cast_uri().ok()).ok_or_else(bad)?;
        let src = m.get("p").and_then(|v| v.cast_str().ok()).ok_or_else(bad)?;
        let program = compile(&src).map_err(|_| bad())?;
        out.push((uri, program));
    }
    Ok(out)
}
