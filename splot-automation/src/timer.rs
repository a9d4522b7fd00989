//! Scheduled timers.
//!
//! A timer's schedule program is evaluated with the shared clock
//! variables plus `c` (the fire count); a positive number result is
//! the seconds until the next fire, anything else terminates
//! scheduling. At fire time the predicate program gates action
//! dispatch but never the count or the reschedule.
use crate::{
    action::{ActionsTrait, TrapSink},
    manager::{ChildReaper, ManagedChild},
    rtc,
};
use arcstr::ArcStr;
use compact_str::format_compact;
use parking_lot::Mutex;
use splot_core::{
    deferred,
    dispatch::{ArgMap, MethodDef, PropertyDef, StoredTrait, ThingTrait, TraitCallback},
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
    time::Duration,
};
use tokio::time::Instant;

struct TimerState {
    enabled: bool,
    auto_reset: bool,
    auto_delete: bool,
    count: i64,
    schedule: Option<Program>,
    predicate: Option<Program>,
    scheduled: Option<splot_core::Scheduled>,
    running: bool,
    last_fired: Option<Instant>,
    fire_at: Option<Instant>,
    trap: Option<ArcStr>,
    owner: Option<(ArcStr, Weak<dyn ChildReaper>)>,
}

pub struct LocalTimer {
    me: Weak<LocalTimer>,
    base: Arc<LocalThing>,
    host: Mutex<WeakHost>,
    timer_trait: Arc<TimerTrait>,
    acti: Arc<ActionsTrait>,
    state: Mutex<TimerState>,
}

impl fmt::Debug for LocalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalTimer({})", self.base.uid())
    }
}

impl LocalTimer {
    pub fn new(
        uid: impl Into<ArcStr>,
        host: WeakHost,
        exec: Option<Exec>,
    ) -> Arc<LocalTimer> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<LocalTimer>| {
            let timer_trait = Arc::new(TimerTrait::new(me.clone()));
            let acti = Arc::new(ActionsTrait::new());
            let mut b = LocalThing::builder()
                .uid(uid)
                .with_trait(timer_trait.clone())
                .with_trait(acti.clone());
            if let Some(exec) = exec {
                b = b.executor(exec);
            }
            LocalTimer {
                me: me.clone(),
                base: b.build(),
                host: Mutex::new(host),
                timer_trait,
                acti,
                state: Mutex::new(TimerState {
                    enabled: false,
                    auto_reset: false,
                    auto_delete: false,
                    count: 0,
                    schedule: None,
                    predicate: None,
                    scheduled: None,
                    running: false,
                    last_fired: None,
                    fire_at: None,
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

    pub fn running(&self) -> bool {
        self.state.lock().running
    }

    fn announce(&self, name: &str, value: Value) {
        self.timer_trait.announce(name, value)
    }

    fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut st = self.state.lock();
            let changed = st.enabled != enabled;
            st.enabled = enabled;
            changed
        };
        if !changed {
            return;
        }
        if enabled {
            self.arm()
        } else {
            self.disarm()
        }
    }

    /// Evaluate the schedule and arm the one shot fire. A non number
    /// or non positive result terminates scheduling.
    fn arm(&self) {
        let (prog, count) = {
            let st = self.state.lock();
            (st.schedule.clone(), st.count)
        };
        let secs = match prog {
            None => None,
            Some(p) => match p.eval(&rtc::program_vars(count)) {
                Ok(v) => v.and_then(|v| v.cast_f64().ok()).filter(|s| *s > 0.),
                Err(e) => {
                    log::warn!("{}: schedule evaluation failed: {e}", self.base.uid());
                    self.set_trap(Some(ArcStr::from(
                        format_compact!("sched:{}", Error::from(e).token()).as_str(),
                    )));
                    None
                }
            },
        };
        match secs.and_then(|s| Duration::try_from_secs_f64(s).ok()) {
            Some(delay) => {
                let weak = self.me.clone();
                let sched = self.base.executor().schedule(
                    delay,
                    Box::new(move || {
                        if let Some(t) = weak.upgrade() {
                            t.fire()
                        }
                    }),
                );
                {
                    let mut st = self.state.lock();
                    st.scheduled = Some(sched);
                    st.fire_at = Some(Instant::now() + delay);
                    st.running = true;
                }
                self.announce("s/timr/run", Value::Bool(true));
            }
            None => self.go_idle(),
        }
    }

    fn disarm(&self) {
        {
            let mut st = self.state.lock();
            st.scheduled = None;
            st.fire_at = None;
            st.running = false;
        }
        self.announce("s/timr/run", Value::Bool(false));
    }

    fn go_idle(&self) {
        self.disarm();
        let reap = {
            let st = self.state.lock();
            if st.auto_delete { st.owner.clone() } else { None }
        };
        if let Some((id, reaper)) = reap {
            if let Some(r) = reaper.upgrade() {
                r.reap(&id)
            }
        }
    }

    /// One fire: predicate gates the actions, the count and the
    /// reschedule happen either way.
    fn fire(&self) {
        let (pred, count, auto_reset) = {
            let mut st = self.state.lock();
            st.scheduled = None;
            st.fire_at = None;
            (st.predicate.clone(), st.count, st.auto_reset)
        };
        let vars = rtc::program_vars(count);
        let pass = match &pred {
            None => true,
            Some(p) => match p.eval(&vars) {
                Ok(Some(v)) => v.cast_bool().unwrap_or(false),
                Ok(None) => false,
                Err(e) => {
                    log::warn!("{}: predicate failed: {e}", self.base.uid());
                    self.set_trap(Some(ArcStr::from(
                        format_compact!("pred:{}", Error::from(e).token()).as_str(),
                    )));
                    false
                }
            },
        };
        if pass {
            let actions = self.acti.actions();
            if !actions.is_empty() {
                let host = self.host.lock().clone();
                let weak = self.me.clone();
                let sink: TrapSink = Arc::new(move |t| {
                    if let Some(timer) = weak.upgrade() {
                        timer.set_trap(t)
                    }
                });
                actions.dispatch(host, &self.base.executor(), sink);
            }
        }
        let new_count = {
            let mut st = self.state.lock();
            st.count += 1;
            st.last_fired = Some(Instant::now());
            st.count
        };
        self.announce("s/timr/c", Value::I64(new_count));
        if auto_reset {
            self.arm()
        } else {
            self.go_idle()
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
            self.announce("m/timr/trap", trap.map(Value::String).unwrap_or(Value::Null))
        }
    }
}

impl Thing for LocalTimer {
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
    }

    fn detached(&self) {
        self.set_enabled(false)
    }
}

impl ManagedChild for LocalTimer {
    const SHORT: &'static str = "timr";

    fn create(host: WeakHost, exec: Exec, uid: ArcStr) -> Arc<Self> {
        LocalTimer::new(uid, host, Some(exec))
    }

    fn set_owner(&self, id: ArcStr, reaper: Weak<dyn ChildReaper>) {
        self.state.lock().owner = Some((id, reaper));
    }

    fn as_thing(self: Arc<Self>) -> ArcThing {
        self
    }
}

/// The timer trait: configuration leaves stored, lifecycle leaves
/// derived from the live timer state.
#[derive(Debug)]
pub struct TimerTrait {
    timer: Weak<LocalTimer>,
    store: StoredTrait,
    methods: Vec<MethodDef>,
}

impl TimerTrait {
    fn new(timer: Weak<LocalTimer>) -> Self {
        TimerTrait {
            timer,
            store: StoredTrait::new(splot_core::propdefs![
                (Config, "timr", "enab", Bool, Get | Set),
                (Config, "timr", "arst", Bool, Get | Set),
                (Config, "timr", "adel", Bool, Get | Set),
                (Config, "timr", "schd", String, Get | Set),
                (Config, "timr", "pred", String, Get | Set),
                (State, "timr", "run", Bool, Get | NoSave | NoTrans | Volatile),
                (State, "timr", "c", Int, Get | Set | Reset | NoTrans),
                (State, "timr", "last", Int, Get | NoSave | NoTrans | Volatile),
                (State, "timr", "next", Real, Get | NoSave | NoTrans | Volatile),
                (Metadata, "timr", "trap", String, Get | Volatile),
            ]),
            methods: Vec::new(),
        }
    }

    fn announce(&self, name: &str, value: Value) {
        if let Some(k) = self.store.key_of(name) {
            let k = k.clone();
            self.store.store_and_announce(&k, value)
        }
    }

    fn timer(&self, key: &PropertyKey) -> Result<Arc<LocalTimer>> {
        self.timer
            .upgrade()
            .ok_or_else(|| Error::BadStateForPropertyValue(key.name().clone()))
    }
}

impl ThingTrait for TimerTrait {
    fn name(&self) -> &'static str {
        "Timer"
    }

    fn short_id(&self) -> &'static str {
        "timr"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:timer"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.def(key)?;
        let t = self.timer(key)?;
        let st = t.state.lock();
        let v = match key.leaf().as_str() {
            "run" => Value::Bool(st.running),
            "c" => Value::I64(st.count),
            // whole second truncation, as the protocol reads it
            "last" => st
                .last_fired
                .map(|i| Value::I64(i.elapsed().as_secs() as i64))
                .unwrap_or(Value::Null),
            "next" => st
                .fire_at
                .map(|i| {
                    Value::F64(i.saturating_duration_since(Instant::now()).as_secs_f64())
                })
                .unwrap_or(Value::Null),
            "trap" => st.trap.clone().map(Value::String).unwrap_or(Value::Null),
            _ => {
                drop(st);
                return self.store.raw_get(key);
            }
        };
        Ok(v)
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        let t = self.timer(key)?;
        match key.leaf().as_str() {
            "enab" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                t.set_enabled(b);
                Ok(())
            }
            "arst" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                t.state.lock().auto_reset = b;
                Ok(())
            }
            "adel" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                t.state.lock().auto_delete = b;
                Ok(())
            }
            "schd" => {
                let prog = compile_or_reject(key, &value)?;
                self.store.raw_set(key, value)?;
                let enabled = {
                    let mut st = t.state.lock();
                    st.schedule = prog;
                    st.enabled
                };
                if enabled {
                    t.arm()
                }
                Ok(())
            }
            "pred" => {
                let prog = compile_or_reject(key, &value)?;
                self.store.raw_set(key, value)?;
                t.state.lock().predicate = prog;
                Ok(())
            }
            "c" => {
                let n = value
                    .cast_i64()
                    .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
                self.store.raw_set(key, value)?;
                t.state.lock().count = n;
                Ok(())
            }
            _ => self.store.raw_set(key, value),
        }
    }
}

fn compile_or_reject(key: &PropertyKey, value: &Value) -> Result<Option<Program>> {
    match value {
        Value::Null => Ok(None),
        v => {
            let src = v
                .cast_str()
                .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
            // compile errors surface on assignment of the recipe
            compile(&src)
                .map(Some)
                .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))
        }
    }
}
