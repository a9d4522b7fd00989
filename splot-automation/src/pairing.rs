//! Reactive pairings: a two point binding between a source and a
//! destination property with optional RPN transforms in each
//! direction.
//!
//! The push loop (pull is symmetric with the reverse transform):
//! source change -> dedup against the last pushed value -> epsilon
//! suppression -> forward transform -> dedup/epsilon against the
//! destination -> invoke. Failures publish through the push/pull
//! trap leaves and never stop the pairing.
use crate::manager::{ChildReaper, ManagedChild};
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
use tokio::time::Instant;

const DEFAULT_EPSILON: f64 = 1e-4;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

struct PairingState {
    enabled: bool,
    push: bool,
    pull: bool,
    src_uri: Option<ArcStr>,
    dst_uri: Option<ArcStr>,
    src_link: Option<Arc<dyn ResourceLink>>,
    dst_link: Option<Arc<dyn ResourceLink>>,
    src_obs: Option<Observation>,
    dst_obs: Option<Observation>,
    fwd: Option<Program>,
    rev: Option<Program>,
    src_last: Option<Value>,
    dst_last: Option<Value>,
    src_epsilon: f64,
    dst_epsilon: f64,
    push_trap: Option<ArcStr>,
    pull_trap: Option<ArcStr>,
    count: i64,
    stamp: Option<Instant>,
    owner: Option<(ArcStr, Weak<dyn ChildReaper>)>,
}

pub struct LocalPairing {
    me: Weak<LocalPairing>,
    base: Arc<LocalThing>,
    host: Mutex<WeakHost>,
    pair_trait: Arc<PairTrait>,
    state: Mutex<PairingState>,
}

impl fmt::Debug for LocalPairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalPairing({})", self.base.uid())
    }
}

impl LocalPairing {
    pub fn new(
        uid: impl Into<ArcStr>,
        host: WeakHost,
        exec: Option<Exec>,
    ) -> Arc<LocalPairing> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<LocalPairing>| {
            let pair_trait = Arc::new(PairTrait::new(me.clone()));
            let mut b = LocalThing::builder().uid(uid).with_trait(pair_trait.clone());
            if let Some(exec) = exec {
                b = b.executor(exec);
            }
            LocalPairing {
                me: me.clone(),
                base: b.build(),
                host: Mutex::new(host),
                pair_trait,
                state: Mutex::new(PairingState {
                    enabled: false,
                    push: false,
                    pull: false,
                    src_uri: None,
                    dst_uri: None,
                    src_link: None,
                    dst_link: None,
                    src_obs: None,
                    dst_obs: None,
                    fwd: None,
                    rev: None,
                    src_last: None,
                    dst_last: None,
                    src_epsilon: DEFAULT_EPSILON,
                    dst_epsilon: DEFAULT_EPSILON,
                    push_trap: None,
                    pull_trap: None,
                    count: 0,
                    stamp: None,
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

    fn set_link(&self, dir: Direction, uri: Option<ArcStr>) -> Result<()> {
        let link = match (&uri, self.host.lock().upgrade()) {
            (Some(u), Some(host)) => Some(host.link(u)?),
            (_, _) => None,
        };
        let enabled = {
            let mut st = self.state.lock();
            // reassignment drops both observers before the link is
            // replaced
            st.src_obs = None;
            st.dst_obs = None;
            match dir {
                Direction::Push => {
                    st.src_uri = uri;
                    st.src_link = link;
                    st.src_last = None;
                }
                Direction::Pull => {
                    st.dst_uri = uri;
                    st.dst_link = link;
                    st.dst_last = None;
                }
            }
            st.enabled
        };
        if enabled {
            self.rewire()
        }
        Ok(())
    }

    /// Attach observers for whichever directions are enabled.
    fn rewire(&self) {
        let exec = self.base.executor();
        let mut st = self.state.lock();
        st.src_obs = None;
        st.dst_obs = None;
        if !st.enabled {
            return;
        }
        if st.push {
            if let Some(l) = &st.src_link {
                let weak = self.me.clone();
                match l.observe(
                    exec.clone(),
                    Arc::new(move |v: &Value| {
                        if let Some(p) = weak.upgrade() {
                            p.on_value(Direction::Push, v.clone())
                        }
                    }),
                ) {
                    Ok(o) => st.src_obs = Some(o),
                    Err(e) => log::warn!("{}: source observe: {e}", self.base.uid()),
                }
            }
        }
        if st.pull {
            if let Some(l) = &st.dst_link {
                let weak = self.me.clone();
                match l.observe(
                    exec,
                    Arc::new(move |v: &Value| {
                        if let Some(p) = weak.upgrade() {
                            p.on_value(Direction::Pull, v.clone())
                        }
                    }),
                ) {
                    Ok(o) => st.dst_obs = Some(o),
                    Err(e) => log::warn!("{}: destination observe: {e}", self.base.uid()),
                }
            }
        }
    }

    /// Re-run the last known endpoint value through the pipeline,
    /// bringing the other side up to date after a transform reload.
    fn replay(&self, dir: Direction) {
        let link = {
            let st = self.state.lock();
            match dir {
                Direction::Push => st.src_link.clone(),
                Direction::Pull => st.dst_link.clone(),
            }
        };
        let link = match link {
            None => return,
            Some(l) => l,
        };
        let weak = self.me.clone();
        let fut = link.fetch_value();
        self.base.executor().spawn_boxed(Box::pin(async move {
            if let Ok(v) = fut.await {
                if let Some(p) = weak.upgrade() {
                    p.on_value(dir, v)
                }
            }
        }));
    }

    /// The reactive loop for one direction.
    fn on_value(&self, dir: Direction, v: Value) {
        let work = {
            let mut st = self.state.lock();
            let active = st.enabled
                && match dir {
                    Direction::Push => st.push,
                    Direction::Pull => st.pull,
                };
            if !active {
                return;
            }
            let (last, epsilon) = match dir {
                Direction::Push => (st.src_last.clone(), st.src_epsilon),
                Direction::Pull => (st.dst_last.clone(), st.dst_epsilon),
            };
            if let Some(last) = &last {
                if v.identical(last) {
                    return;
                }
                if let (Some(a), Some(b)) = (v.as_f64(), last.as_f64()) {
                    if (a - b).abs() < epsilon {
                        return;
                    }
                }
            }
            let transform = match dir {
                Direction::Push => st.fwd.clone(),
                Direction::Pull => st.rev.clone(),
            };
            let out = match &transform {
                // the identity transform
                None => Some(v.clone()),
                Some(p) => {
                    let mut vars = FxHashMap::default();
                    vars.insert(arcstr::literal!("v"), v.clone());
                    vars.insert(
                        arcstr::literal!("v_l"),
                        last.clone().unwrap_or(Value::Null),
                    );
                    match p.eval(&vars) {
                        Ok(out) => out,
                        Err(e) => {
                            log::warn!("{}: transform failed: {e}", self.base.uid());
                            drop(st);
                            self.set_trap(
                                dir,
                                Some(ArcStr::from(Error::from(e).token())),
                            );
                            let mut st = self.state.lock();
                            match dir {
                                Direction::Push => st.src_last = Some(v),
                                Direction::Pull => st.dst_last = Some(v),
                            }
                            return;
                        }
                    }
                }
            };
            match dir {
                Direction::Push => st.src_last = Some(v),
                Direction::Pull => st.dst_last = Some(v),
            }
            let out = match out {
                // STOP means no emission
                None => return,
                Some(o) => o,
            };
            let (far_last, far_epsilon, far_link) = match dir {
                Direction::Push => {
                    (st.dst_last.clone(), st.dst_epsilon, st.dst_link.clone())
                }
                Direction::Pull => {
                    (st.src_last.clone(), st.src_epsilon, st.src_link.clone())
                }
            };
            if let Some(fl) = &far_last {
                if out.identical(fl) {
                    return;
                }
                if let (Some(a), Some(b)) = (out.as_f64(), fl.as_f64()) {
                    if (a - b).abs() < far_epsilon {
                        return;
                    }
                }
            }
            match dir {
                Direction::Push => st.dst_last = Some(out.clone()),
                Direction::Pull => st.src_last = Some(out.clone()),
            }
            st.count += 1;
            st.stamp = Some(Instant::now());
            let count = st.count;
            (far_link, out, count)
        };
        let (link, out, count) = work;
        self.set_trap(dir, None);
        self.pair_trait.announce("s/pair/c", Value::I64(count));
        if let Some(link) = link {
            let weak = self.me.clone();
            let fut = link.invoke(out);
            self.base.executor().spawn_boxed(Box::pin(async move {
                if let Err(e) = fut.await {
                    log::warn!("pairing write failed: {e}");
                    if let Some(p) = weak.upgrade() {
                        p.set_trap(dir, Some(arcstr::literal!("destination-write-fail")))
                    }
                }
            }));
        }
    }

    fn set_trap(&self, dir: Direction, trap: Option<ArcStr>) {
        let (name, changed) = {
            let mut st = self.state.lock();
            match dir {
                Direction::Push => {
                    let changed = st.push_trap != trap;
                    st.push_trap = trap.clone();
                    ("m/pair/ptrap", changed)
                }
                Direction::Pull => {
                    let changed = st.pull_trap != trap;
                    st.pull_trap = trap.clone();
                    ("m/pair/ltrap", changed)
                }
            }
        };
        if changed {
            self.pair_trait
                .announce(name, trap.map(Value::String).unwrap_or(Value::Null))
        }
    }

    fn set_enabled(&self, enabled: bool) {
        {
            let mut st = self.state.lock();
            st.enabled = enabled;
        }
        self.rewire()
    }
}

impl Thing for LocalPairing {
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
        // re-resolve stored endpoints now that a namespace exists
        let (src, dst) = {
            let st = self.state.lock();
            (st.src_uri.clone(), st.dst_uri.clone())
        };
        if let Some(u) = src {
            if let Err(e) = self.set_link(Direction::Push, Some(u)) {
                log::warn!("{}: source resolve: {e}", self.base.uid())
            }
        }
        if let Some(u) = dst {
            if let Err(e) = self.set_link(Direction::Pull, Some(u)) {
                log::warn!("{}: destination resolve: {e}", self.base.uid())
            }
        }
    }

    fn detached(&self) {
        let mut st = self.state.lock();
        st.src_obs = None;
        st.dst_obs = None;
        st.src_link = None;
        st.dst_link = None;
    }
}

impl ManagedChild for LocalPairing {
    const SHORT: &'static str = "pair";

    fn create(host: WeakHost, exec: Exec, uid: ArcStr) -> Arc<Self> {
        LocalPairing::new(uid, host, Some(exec))
    }

    fn set_owner(&self, id: ArcStr, reaper: Weak<dyn ChildReaper>) {
        self.state.lock().owner = Some((id, reaper));
    }

    fn as_thing(self: Arc<Self>) -> ArcThing {
        self
    }
}

#[derive(Debug)]
pub struct PairTrait {
    pairing: Weak<LocalPairing>,
    store: StoredTrait,
}

impl PairTrait {
    fn new(pairing: Weak<LocalPairing>) -> Self {
        PairTrait {
            pairing,
            store: StoredTrait::with_values(
                splot_core::propdefs![
                    (Config, "pair", "src", Uri, Get | Set),
                    (Config, "pair", "dst", Uri, Get | Set),
                    (Config, "pair", "push", Bool, Get | Set),
                    (Config, "pair", "pull", Bool, Get | Set),
                    (Config, "pair", "enab", Bool, Get | Set),
                    (Config, "pair", "fwd", String, Get | Set),
                    (Config, "pair", "rev", String, Get | Set),
                    (Config, "pair", "seps", Real, Get | Set),
                    (Config, "pair", "deps", Real, Get | Set),
                    (State, "pair", "c", Int, Get | Set | Reset | NoTrans),
                    (State, "pair", "last", Int, Get | NoSave | NoTrans | Volatile),
                    (Metadata, "pair", "ptrap", String, Get | Volatile),
                    (Metadata, "pair", "ltrap", String, Get | Volatile),
                ],
                [
                    (arcstr::literal!("c/pair/seps"), Value::F64(DEFAULT_EPSILON)),
                    (arcstr::literal!("c/pair/deps"), Value::F64(DEFAULT_EPSILON)),
                ],
            ),
        }
    }

    fn announce(&self, name: &str, value: Value) {
        if let Some(k) = self.store.key_of(name) {
            let k = k.clone();
            self.store.store_and_announce(&k, value)
        }
    }

    fn pairing(&self, key: &PropertyKey) -> Result<Arc<LocalPairing>> {
        self.pairing
            .upgrade()
            .ok_or_else(|| Error::BadStateForPropertyValue(key.name().clone()))
    }
}

impl ThingTrait for PairTrait {
    fn name(&self) -> &'static str {
        "Pairing"
    }

    fn short_id(&self) -> &'static str {
        "pair"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:pairing"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.def(key)?;
        let p = self.pairing(key)?;
        let st = p.state.lock();
        let v = match key.leaf().as_str() {
            "c" => Value::I64(st.count),
            "last" => st
                .stamp
                .map(|i| Value::I64(i.elapsed().as_secs() as i64))
                .unwrap_or(Value::Null),
            "ptrap" => st.push_trap.clone().map(Value::String).unwrap_or(Value::Null),
            "ltrap" => st.pull_trap.clone().map(Value::String).unwrap_or(Value::Null),
            _ => {
                drop(st);
                return self.store.raw_get(key);
            }
        };
        Ok(v)
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        let p = self.pairing(key)?;
        match key.leaf().as_str() {
            "src" => {
                let uri = value.cast_to::<Option<ArcStr>>()?;
                self.store.raw_set(key, value)?;
                p.set_link(Direction::Push, uri)
            }
            "dst" => {
                let uri = value.cast_to::<Option<ArcStr>>()?;
                self.store.raw_set(key, value)?;
                p.set_link(Direction::Pull, uri)
            }
            "push" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                {
                    p.state.lock().push = b;
                }
                p.rewire();
                Ok(())
            }
            "pull" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                {
                    p.state.lock().pull = b;
                }
                p.rewire();
                Ok(())
            }
            "enab" => {
                let b = value.cast_bool().unwrap_or(false);
                self.store.raw_set(key, value)?;
                p.set_enabled(b);
                Ok(())
            }
            "fwd" => {
                let prog = compile_transform(key, &value)?;
                self.store.raw_set(key, value)?;
                {
                    let mut st = p.state.lock();
                    st.fwd = prog;
                    st.src_last = None;
                    st.dst_last = None;
                }
                p.replay(Direction::Push);
                Ok(())
            }
            "rev" => {
                let prog = compile_transform(key, &value)?;
                self.store.raw_set(key, value)?;
                {
                    let mut st = p.state.lock();
                    st.rev = prog;
                    st.src_last = None;
                    st.dst_last = None;
                }
                p.replay(Direction::Pull);
                Ok(())
            }
            "seps" => {
                let e = value
                    .cast_f64()
                    .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
                self.store.raw_set(key, value)?;
                p.state.lock().src_epsilon = e;
                Ok(())
            }
            "deps" => {
                let e = value
                    .cast_f64()
                    .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
                self.store.raw_set(key, value)?;
                p.state.lock().dst_epsilon = e;
                Ok(())
            }
            "c" => {
                let n = value
                    .cast_i64()
                    .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
                self.store.raw_set(key, value)?;
                p.state.lock().count = n;
                Ok(())
            }
            _ => self.store.raw_set(key, value),
        }
    }
}

fn compile_transform(key: &PropertyKey, value: &Value) -> Result<Option<Program>> {
    match value {
        Value::Null => Ok(None),
        v => {
            let src = v
                .cast_str()
                .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
            compile(&src)
                .map(Some)
                .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))
        }
    }
}
