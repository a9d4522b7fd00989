//! The Thing base: trait registry, property dispatch, section
//! caching, listener fan out, and persistence snapshot/restore.
//!
//! Writes to a single Thing are serialized by one short operation
//! lock, so per Thing operations appear atomic to listeners, and
//! transition ticks never interleave with an explicit write on the
//! same Thing. Section caches are immutable maps, so a reader always
//! holds a self consistent snapshot.
use crate::{
    deferred,
    dispatch::{ArgMap, PropertyDef, ThingTrait, TraitCallback},
    error::{Error, Result},
    exec::{default_executor, Exec},
    host::Host,
    key::{Modifier, Mutation, SectionKind},
    scene::Scene,
    transition::Transition,
    Deferred,
};
use arcstr::{literal, ArcStr};
use fxhash::FxHashMap;
use immutable_chunkmap::map::MapS;
use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use splot_value::Value;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use uuid::Uuid;

pub type ArcThing = Arc<dyn Thing>;
pub type PropertyBatch = IndexMap<ArcStr, Value>;
pub type SectionMap = MapS<ArcStr, Value>;
pub type Snapshot = IndexMap<ArcStr, Value>;

pub type PropertyCallback = Arc<dyn Fn(&ArcStr, &Value) + Send + Sync>;
pub type SectionCallback = Arc<dyn Fn(SectionKind, &SectionMap) + Send + Sync>;
pub type ChildCallback = Arc<dyn Fn(&ChildEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ChildEvent {
    Added { trait_id: ArcStr, id: ArcStr, child: ArcThing },
    Removed { trait_id: ArcStr, id: ArcStr },
}

pub(crate) const KEY_SCENE_SID: &str = "s/scen/sid";
pub(crate) const KEY_TRAN_D: &str = "s/tran/d";
pub(crate) const KEY_TRAN_SP: &str = "s/tran/sp";
pub(crate) const KEY_TRAN_DEFAULT: &str = "c/tran/ddur";
pub(crate) const KEY_ONOFF: &str = "s/onof/v";
pub(crate) const LEVEL_KEYS: [&str; 2] = ["s/levl/v", "s/lght/v"];

/// Keys never included in a persistence snapshot or a transition
/// begin map.
pub(crate) const STRIPPED: [&str; 3] = [KEY_TRAN_D, KEY_TRAN_SP, KEY_SCENE_SID];

/// The uniform object model surface. Everything hosted in the
/// namespace implements this: local things, groups, scenes,
/// automations.
pub trait Thing: Send + Sync + fmt::Debug + 'static {
    fn uid(&self) -> ArcStr;

    /// The local base, for things that are built on one.
    fn local(&self) -> Option<&LocalThing> {
        None
    }

    fn is_native_group(&self) -> bool {
        false
    }

    fn set_property(&self, name: &str, value: Value, mods: &[Modifier]) -> Deferred<()>;

    fn fetch_property(&self, name: &str, mods: &[Modifier]) -> Deferred<Value>;

    fn fetch_section(&self, section: SectionKind, mods: &[Modifier]) -> Deferred<SectionMap>;

    fn apply_properties(&self, props: PropertyBatch, mods: &[Modifier]) -> Deferred<()>;

    fn invoke_method(&self, name: &str, args: ArgMap) -> Deferred<Value>;

    fn register_property_listener(
        &self,
        _exec: Exec,
        _cb: PropertyCallback,
    ) -> Result<ListenerHandle> {
        Err(Error::PropertyOperationUnsupported(self.uid()))
    }

    fn register_section_listener(
        &self,
        _section: SectionKind,
        _exec: Exec,
        _cb: SectionCallback,
    ) -> Result<ListenerHandle> {
        Err(Error::PropertyOperationUnsupported(self.uid()))
    }

    fn register_child_listener(
        &self,
        _exec: Exec,
        _cb: ChildCallback,
    ) -> Result<ListenerHandle> {
        Err(Error::PropertyOperationUnsupported(self.uid()))
    }

    fn child_by_id(&self, trait_id: &str, child_id: &str) -> Option<ArcThing> {
        self.local().and_then(|l| l.trait_child(trait_id, child_id))
    }

    fn copy_persistent_state(&self) -> Snapshot;

    fn init_with_persistent_state(&self, snap: Snapshot) -> Result<()>;

    /// Called when the thing is hosted.
    fn attached(&self, _host: &Host, _index: u32) {}

    /// Called when the thing is unhosted.
    fn detached(&self) {}

    /// Called for every thing already hosted when another thing is
    /// hosted alongside it. Groups use this to resolve members known
    /// only by uid.
    fn peer_hosted(&self, _peer: &ArcThing) {}
}

struct ListenerEntry<T> {
    id: u64,
    alive: Arc<AtomicBool>,
    exec: Exec,
    cb: T,
}

impl<T> ListenerEntry<T> {
    fn new(id: u64, exec: Exec, cb: T) -> Self {
        ListenerEntry { id, alive: Arc::new(AtomicBool::new(true)), exec, cb }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Property,
    Section,
    Child,
}

/// Registration handle; dropping it unregisters the listener. If the
/// drop happens before the executor dispatches the synthetic initial
/// notification, that notification is cancelled.
pub struct ListenerHandle {
    thing: Weak<LocalThing>,
    kind: ListenerKind,
    id: u64,
    alive: Arc<AtomicBool>,
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle({})", self.id)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(t) = self.thing.upgrade() {
            let mut st = t.state.lock();
            match self.kind {
                ListenerKind::Property => {
                    st.prop_listeners.retain(|e| e.id != self.id)
                }
                ListenerKind::Section => {
                    st.section_listeners.retain(|(_, e)| e.id != self.id)
                }
                ListenerKind::Child => st.child_listeners.retain(|e| e.id != self.id),
            }
        }
    }
}

pub(crate) struct ThingState {
    pub(crate) caches: [SectionMap; 3],
    prop_listeners: Vec<ListenerEntry<PropertyCallback>>,
    section_listeners: Vec<(SectionKind, ListenerEntry<SectionCallback>)>,
    child_listeners: Vec<ListenerEntry<ChildCallback>>,
    next_listener: u64,
    pub(crate) transition: Option<Transition>,
    pub(crate) scenes: IndexMap<ArcStr, Arc<Scene>>,
    unknown_persist: IndexMap<ArcStr, Value>,
    parent: Weak<dyn Thing>,
    persist_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

pub struct LocalThing {
    pub(crate) me: Weak<LocalThing>,
    uid: ArcStr,
    pub(crate) exec: Exec,
    traits: Vec<Arc<dyn ThingTrait>>,
    by_short: FxHashMap<ArcStr, usize>,
    by_prop: FxHashMap<ArcStr, usize>,
    by_method: FxHashMap<ArcStr, usize>,
    pub(crate) defs: FxHashMap<ArcStr, PropertyDef>,
    pub(crate) level_key: Option<ArcStr>,
    pub(crate) op_lock: Mutex<()>,
    pub(crate) state: Mutex<ThingState>,
}

impl fmt::Debug for LocalThing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalThing({})", self.uid)
    }
}

pub struct ThingBuilder {
    uid: Option<ArcStr>,
    name: Option<ArcStr>,
    exec: Option<Exec>,
    traits: Vec<Arc<dyn ThingTrait>>,
}

impl ThingBuilder {
    pub fn uid(mut self, uid: impl Into<ArcStr>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn name(mut self, name: impl Into<ArcStr>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn executor(mut self, exec: Exec) -> Self {
        self.exec = Some(exec);
        self
    }

    pub fn with_trait(mut self, t: Arc<dyn ThingTrait>) -> Self {
        self.traits.push(t);
        self
    }

    pub fn build(self) -> Arc<LocalThing> {
        let uid = self
            .uid
            .unwrap_or_else(|| ArcStr::from(Uuid::new_v4().as_simple().to_string()));
        let exec = self.exec.unwrap_or_else(default_executor);
        let mut traits: Vec<Arc<dyn ThingTrait>> =
            vec![Arc::new(crate::traits::base::BaseTrait::new(uid.clone(), self.name))];
        traits.extend(self.traits);
        Arc::new_cyclic(move |me: &Weak<LocalThing>| {
            let mut by_short = FxHashMap::default();
            let mut by_prop = FxHashMap::default();
            let mut by_method = FxHashMap::default();
            let mut defs = FxHashMap::default();
            for (i, t) in traits.iter().enumerate() {
                t.bind(TraitCallback { thing: me.clone() });
                by_short.insert(ArcStr::from(t.short_id()), i);
                for d in t.properties() {
                    by_prop.insert(d.key.name().clone(), i);
                    defs.insert(d.key.name().clone(), d.clone());
                }
                for m in t.methods() {
                    by_method.insert(m.key.name().clone(), i);
                }
            }
            let level_key = LEVEL_KEYS
                .iter()
                .find(|k| defs.contains_key(**k))
                .map(|k| ArcStr::from(*k));
            // prime the section caches so readers are consistent from
            // the start
            let mut caches =
                [SectionMap::new(), SectionMap::new(), SectionMap::new()];
            for t in traits.iter() {
                for d in t.properties() {
                    if !d.readable() {
                        continue;
                    }
                    if let Ok(v) = t.get(&d.key) {
                        if !v.is_null() {
                            caches[d.key.section().index()]
                                .insert_cow(d.key.name().clone(), v);
                        }
                    }
                }
            }
            LocalThing {
                me: me.clone(),
                uid,
                exec,
                traits,
                by_short,
                by_prop,
                by_method,
                defs,
                level_key,
                op_lock: Mutex::new(()),
                state: Mutex::new(ThingState {
                    caches,
                    prop_listeners: Vec::new(),
                    section_listeners: Vec::new(),
                    child_listeners: Vec::new(),
                    next_listener: 0,
                    transition: None,
                    scenes: IndexMap::new(),
                    unknown_persist: IndexMap::new(),
                    parent: Weak::<LocalThing>::new(),
                    persist_hook: None,
                }),
            }
        })
    }
}

impl LocalThing {
    pub fn builder() -> ThingBuilder {
        ThingBuilder { uid: None, name: None, exec: None, traits: Vec::new() }
    }

    pub fn handle(&self) -> Arc<LocalThing> {
        self.me.upgrade().expect("thing deallocated while in use")
    }

    pub fn uid(&self) -> &ArcStr {
        &self.uid
    }

    pub fn executor(&self) -> Exec {
        Arc::clone(&self.exec)
    }

    pub fn set_parent(&self, parent: &ArcThing) {
        self.state.lock().parent = Arc::downgrade(parent);
    }

    pub fn parent(&self) -> Option<ArcThing> {
        self.state.lock().parent.upgrade()
    }

    /// Install the hook invoked whenever persistent state changed out
    /// of band (e.g. when a transition completes). Storage back ends
    /// attach here.
    pub fn on_persist_changed(&self, f: Arc<dyn Fn() + Send + Sync>) {
        self.state.lock().persist_hook = Some(f);
    }

    pub(crate) fn announce_persist_changed(&self) {
        let hook = self.state.lock().persist_hook.clone();
        if let Some(h) = hook {
            h()
        }
    }

    pub fn def(&self, name: &str) -> Option<&PropertyDef> {
        self.defs.get(name)
    }

    pub fn trait_by_short_id(&self, short: &str) -> Option<&Arc<dyn ThingTrait>> {
        self.by_short.get(short).map(|i| &self.traits[*i])
    }

    pub(crate) fn trait_for(&self, name: &str) -> Option<&Arc<dyn ThingTrait>> {
        self.by_prop.get(name).map(|i| &self.traits[*i])
    }

    pub fn traits(&self) -> &[Arc<dyn ThingTrait>] {
        &self.traits
    }

    /// Current value a write relative operation should start from:
    /// the transition target when one is active, otherwise the
    /// instantaneous value.
    pub(crate) fn target_value(&self, name: &str) -> Result<Value> {
        {
            let st = self.state.lock();
            if let Some(tr) = &st.transition {
                if let Some(v) = tr.final_.get(name) {
                    return Ok(v.clone());
                }
            }
        }
        let t = self
            .trait_for(name)
            .ok_or_else(|| Error::PropertyNotFound(ArcStr::from(name)))?;
        let def = self.defs.get(name).expect("index and defs are built together");
        t.get(&def.key)
    }

    pub fn fetch_property_now(&self, name: &str, mods: &[Modifier]) -> Result<Value> {
        if Modifier::wants_target(mods) {
            let st = self.state.lock();
            if let Some(tr) = &st.transition {
                if let Some(v) = tr.final_.get(name) {
                    return Ok(v.clone());
                }
            }
        }
        let t = self
            .trait_for(name)
            .ok_or_else(|| Error::PropertyNotFound(ArcStr::from(name)))?;
        let def = self.defs.get(name).expect("index and defs are built together");
        t.get(&def.key)
    }

    pub fn fetch_section_now(
        &self,
        section: SectionKind,
        mods: &[Modifier],
    ) -> SectionMap {
        let mut m = {
            let st = self.state.lock();
            let mut m = st.caches[section.index()].clone();
            if Modifier::wants_target(mods) {
                if let Some(tr) = &st.transition {
                    for (k, v) in tr.final_.iter() {
                        let sec = self.defs.get(k).map(|d| d.key.section());
                        if sec == Some(section) && !v.is_null() {
                            m.insert_cow(k.clone(), v.clone());
                        }
                    }
                }
            }
            m
        };
        if Modifier::wants_all(mods) {
            for (name, def) in self.defs.iter() {
                if def.key.section() == section
                    && def.readable()
                    && m.get(name.as_str()).is_none()
                {
                    m.insert_cow(name.clone(), Value::Null);
                }
            }
        }
        m
    }

    pub fn set_property_now(
        &self,
        name: &str,
        value: Value,
        mods: &[Modifier],
    ) -> Result<()> {
        let name = ArcStr::from(name);
        let value = match Modifier::mutation(mods)? {
            None => value,
            Some(m) => {
                let cur = self.target_value(&name)?;
                mutate(m, &cur, value, &name)?
            }
        };
        let mut batch = PropertyBatch::new();
        batch.insert(name, value);
        self.apply_properties_now(batch, mods)
    }

    pub fn increment_property(&self, name: &str, delta: Value) -> Result<()> {
        self.set_property_now(name, delta, &[Modifier::Increment])
    }

    pub fn toggle_property(&self, name: &str) -> Result<()> {
        self.set_property_now(name, Value::Null, &[Modifier::Toggle])
    }

    pub fn insert_value(&self, name: &str, value: Value) -> Result<()> {
        self.set_property_now(name, value, &[Modifier::Insert])
    }

    pub fn remove_value(&self, name: &str, value: Value) -> Result<()> {
        self.set_property_now(name, value, &[Modifier::Remove])
    }

    /// The central writer: expand, hook (scenes, transitions), then
    /// immediate application.
    pub fn apply_properties_now(
        &self,
        props: PropertyBatch,
        mods: &[Modifier],
    ) -> Result<()> {
        let _serial = self.op_lock.lock();
        self.apply_locked(props, mods)
    }

    pub(crate) fn apply_locked(
        &self,
        mut props: PropertyBatch,
        mods: &[Modifier],
    ) -> Result<()> {
        // expand: sanitize each value through its trait, leave
        // unregistered names untouched
        let names: Vec<ArcStr> = props.keys().cloned().collect();
        for name in names {
            if let Some(t) = self.trait_for(&name) {
                let def = self.defs.get(&name).expect("indexed");
                let v = props.get(&name).expect("just listed").clone();
                let v = t.sanitize(&def.key, v)?;
                props.insert(name, v);
            }
        }
        // hook: scene recall expands into a bulk write
        if self.defs.contains_key(KEY_SCENE_SID) {
            if let Some(sid) = props.get(KEY_SCENE_SID).cloned() {
                if !sid.is_null() {
                    let sid = sid.cast_str().map_err(|_| {
                        Error::InvalidPropertyValue(ArcStr::from(KEY_SCENE_SID))
                    })?;
                    let scene = self.scene(&sid).ok_or_else(|| {
                        Error::InvalidPropertyValue(ArcStr::from(KEY_SCENE_SID))
                    })?;
                    let mut merged: PropertyBatch = scene.stored().into_iter().collect();
                    for (k, v) in props {
                        merged.insert(k, v);
                    }
                    props = merged;
                }
            }
        }
        // hook: transitions interpose between sanitization and set
        let explicit = Modifier::duration(mods)
            .or_else(|| props.get(KEY_TRAN_D).and_then(|v| v.cast_f64().ok()));
        let duration = explicit.or_else(|| self.default_duration());
        if let Some(d) = duration {
            if d > 0. {
                let mut trans = PropertyBatch::new();
                let mut other = PropertyBatch::new();
                for (name, v) in props {
                    let ok = self
                        .trait_for(&name)
                        .zip(self.defs.get(&name))
                        .map(|(t, def)| t.can_transition(&def.key))
                        .unwrap_or(false);
                    if ok {
                        trans.insert(name, v);
                    } else {
                        other.insert(name, v);
                    }
                }
                if !trans.is_empty() {
                    return self.begin_transition(trans, other, d, explicit.is_some());
                }
                props = other;
            }
        }
        self.apply_now(props)
    }

    fn default_duration(&self) -> Option<f64> {
        if !self.defs.contains_key(KEY_TRAN_DEFAULT) {
            return None;
        }
        let st = self.state.lock();
        st.caches[SectionKind::Config.index()]
            .get(KEY_TRAN_DEFAULT)
            .and_then(|v| v.cast_f64().ok())
            .filter(|d| *d > 0.)
    }

    /// Immediate application: invoke every set, collect the first
    /// error, and keep going so the keys that can succeed do.
    pub(crate) fn apply_now(&self, props: PropertyBatch) -> Result<()> {
        let mut first_err = None;
        let mut applied: SmallVec<[(ArcStr, Value); 8]> = SmallVec::new();
        for (name, v) in props {
            match self.trait_for(&name) {
                None => {
                    if first_err.is_none() {
                        first_err = Some(Error::PropertyNotFound(name.clone()));
                    }
                }
                Some(t) => {
                    let def = self.defs.get(&name).expect("indexed");
                    match t.set(&def.key, v.clone()) {
                        Ok(()) => applied.push((name, v)),
                        Err(e) => {
                            if first_err.is_none() {
                                first_err = Some(e)
                            }
                        }
                    }
                }
            }
        }
        self.commit(&applied);
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Update section caches for the applied writes and fan out
    /// listeners: property listeners first, then the section
    /// listeners of every affected section. Callbacks are scheduled
    /// on their registered executors after the state lock is
    /// released.
    fn commit(&self, applied: &[(ArcStr, Value)]) {
        if applied.is_empty() {
            return;
        }
        let mut tasks: SmallVec<[(Exec, crate::exec::Task); 8]> = SmallVec::new();
        {
            let mut st = self.state.lock();
            let mut touched: SmallVec<[SectionKind; 3]> = SmallVec::new();
            for (name, v) in applied {
                let section = match self.defs.get(name) {
                    Some(d) => d.key.section(),
                    None => continue,
                };
                let cache = &mut st.caches[section.index()];
                if v.is_null() {
                    cache.remove_cow(name);
                } else {
                    cache.insert_cow(name.clone(), v.clone());
                }
                if !touched.contains(&section) {
                    touched.push(section)
                }
            }
            for e in st.prop_listeners.iter() {
                for (name, v) in applied {
                    let alive = e.alive.clone();
                    let cb = e.cb.clone();
                    let name = name.clone();
                    let v = v.clone();
                    tasks.push((
                        e.exec.clone(),
                        Box::new(move || {
                            if alive.load(Ordering::Acquire) {
                                cb(&name, &v)
                            }
                        }),
                    ));
                }
            }
            for section in touched {
                let snap = st.caches[section.index()].clone();
                for (s, e) in st.section_listeners.iter() {
                    if *s != section {
                        continue;
                    }
                    let alive = e.alive.clone();
                    let cb = e.cb.clone();
                    let snap = snap.clone();
                    tasks.push((
                        e.exec.clone(),
                        Box::new(move || {
                            if alive.load(Ordering::Acquire) {
                                cb(section, &snap)
                            }
                        }),
                    ));
                }
            }
        }
        for (exec, task) in tasks {
            exec.execute(task)
        }
    }

    /// An out of band change announced by a trait implementation.
    pub(crate) fn property_changed(&self, name: &ArcStr, value: Value) {
        self.commit(&[(name.clone(), value)]);
    }

    pub fn invoke_now(&self, method: &str, args: &ArgMap) -> Result<Value> {
        match self.by_method.get(method) {
            None => Err(Error::MethodNotFound(ArcStr::from(method))),
            Some(i) => {
                let t = &self.traits[*i];
                let m = t
                    .methods()
                    .iter()
                    .find(|m| m.key.name() == method)
                    .expect("indexed");
                t.invoke(&m.key, args)
            }
        }
    }

    pub fn register_property_listener_now(
        &self,
        exec: Exec,
        cb: PropertyCallback,
    ) -> ListenerHandle {
        let mut tasks: SmallVec<[(Exec, crate::exec::Task); 8]> = SmallVec::new();
        let handle = {
            let mut st = self.state.lock();
            let id = st.next_listener;
            st.next_listener += 1;
            let entry = ListenerEntry::new(id, exec, cb);
            // synthetic initial notification so the caller is
            // immediately consistent
            for section in SectionKind::ALL {
                for (name, v) in st.caches[section.index()].into_iter() {
                    let alive = entry.alive.clone();
                    let cb = entry.cb.clone();
                    let name = name.clone();
                    let v = v.clone();
                    tasks.push((
                        entry.exec.clone(),
                        Box::new(move || {
                            if alive.load(Ordering::Acquire) {
                                cb(&name, &v)
                            }
                        }),
                    ));
                }
            }
            let handle = ListenerHandle {
                thing: self.me.clone(),
                kind: ListenerKind::Property,
                id,
                alive: entry.alive.clone(),
            };
            st.prop_listeners.push(entry);
            handle
        };
        for (exec, task) in tasks {
            exec.execute(task)
        }
        handle
    }

    pub fn register_section_listener_now(
        &self,
        section: SectionKind,
        exec: Exec,
        cb: SectionCallback,
    ) -> ListenerHandle {
        let (handle, task_exec, task): (_, Exec, crate::exec::Task) = {
            let mut st = self.state.lock();
            let id = st.next_listener;
            st.next_listener += 1;
            let entry = ListenerEntry::new(id, exec, cb);
            let snap = st.caches[section.index()].clone();
            let alive = entry.alive.clone();
            let cb = entry.cb.clone();
            let task: crate::exec::Task = Box::new(move || {
                if alive.load(Ordering::Acquire) {
                    cb(section, &snap)
                }
            });
            let handle = ListenerHandle {
                thing: self.me.clone(),
                kind: ListenerKind::Section,
                id,
                alive: entry.alive.clone(),
            };
            let task_exec = entry.exec.clone();
            st.section_listeners.push((section, entry));
            (handle, task_exec, task)
        };
        task_exec.execute(task);
        handle
    }

    pub fn register_child_listener_now(
        &self,
        exec: Exec,
        cb: ChildCallback,
    ) -> ListenerHandle {
        let children = self.children();
        let (handle, task_exec, task): (_, Exec, crate::exec::Task) = {
            let mut st = self.state.lock();
            let id = st.next_listener;
            st.next_listener += 1;
            let entry = ListenerEntry::new(id, exec, cb);
            let alive = entry.alive.clone();
            let cb = entry.cb.clone();
            let task: crate::exec::Task = Box::new(move || {
                if alive.load(Ordering::Acquire) {
                    for (trait_id, id, child) in children.iter() {
                        cb(&ChildEvent::Added {
                            trait_id: trait_id.clone(),
                            id: id.clone(),
                            child: child.clone(),
                        })
                    }
                }
            });
            let handle = ListenerHandle {
                thing: self.me.clone(),
                kind: ListenerKind::Child,
                id,
                alive: entry.alive.clone(),
            };
            let task_exec = entry.exec.clone();
            st.child_listeners.push(entry);
            (handle, task_exec, task)
        };
        task_exec.execute(task);
        handle
    }

    pub(crate) fn child_added(&self, trait_id: ArcStr, id: ArcStr, child: ArcThing) {
        self.fan_out_child(ChildEvent::Added { trait_id, id, child })
    }

    pub(crate) fn child_removed(&self, trait_id: ArcStr, id: ArcStr) {
        self.fan_out_child(ChildEvent::Removed { trait_id, id })
    }

    fn fan_out_child(&self, ev: ChildEvent) {
        let mut tasks: SmallVec<[(Exec, crate::exec::Task); 4]> = SmallVec::new();
        {
            let st = self.state.lock();
            for e in st.child_listeners.iter() {
                let alive = e.alive.clone();
                let cb = e.cb.clone();
                let ev = ev.clone();
                tasks.push((
                    e.exec.clone(),
                    Box::new(move || {
                        if alive.load(Ordering::Acquire) {
                            cb(&ev)
                        }
                    }),
                ));
            }
        }
        for (exec, task) in tasks {
            exec.execute(task)
        }
    }

    /// All current children: scenes plus whatever the child bearing
    /// traits report.
    pub fn children(&self) -> Vec<(ArcStr, ArcStr, ArcThing)> {
        let mut out: Vec<(ArcStr, ArcStr, ArcThing)> = Vec::new();
        {
            let st = self.state.lock();
            for (id, s) in st.scenes.iter() {
                out.push((literal!("scen"), id.clone(), s.clone() as ArcThing));
            }
        }
        for t in self.traits.iter() {
            if t.has_children() {
                let tid = ArcStr::from(t.short_id());
                for (id, c) in t.copy_children() {
                    out.push((tid.clone(), id, c));
                }
            }
        }
        out
    }

    pub fn trait_child(&self, trait_id: &str, child_id: &str) -> Option<ArcThing> {
        if trait_id == "scen" {
            return self.scene(child_id).map(|s| s as ArcThing);
        }
        self.trait_by_short_id(trait_id).and_then(|t| t.child_by_id(child_id))
    }

    pub fn scene(&self, id: &str) -> Option<Arc<Scene>> {
        self.state.lock().scenes.get(id).cloned()
    }

    pub fn scenes(&self) -> Vec<(ArcStr, Arc<Scene>)> {
        self.state.lock().scenes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Create or overwrite a scene from the current save eligible
    /// state.
    pub fn save_scene(&self, sid: ArcStr, group_id: Option<ArcStr>) -> Result<()> {
        let mut stored = IndexMap::new();
        for t in self.traits.iter() {
            for d in t.properties() {
                let name = d.key.name();
                if d.key.section() != SectionKind::State
                    || STRIPPED.contains(&name.as_str())
                    || !t.can_save(&d.key)
                {
                    continue;
                }
                if let Ok(v) = t.get(&d.key) {
                    if !v.is_null() {
                        stored.insert(name.clone(), v);
                    }
                }
            }
        }
        let scene = Scene::new(self.me.clone(), sid.clone(), stored, group_id);
        let replaced = {
            let mut st = self.state.lock();
            st.scenes.insert(sid.clone(), scene.clone()).is_some()
        };
        if !replaced {
            self.child_added(literal!("scen"), sid, scene as ArcThing);
        }
        self.announce_persist_changed();
        Ok(())
    }

    pub fn delete_scene(&self, sid: &str) -> Result<()> {
        let removed = self.state.lock().scenes.shift_remove(sid);
        match removed {
            None => Err(Error::UnknownResource(ArcStr::from(sid))),
            Some(_) => {
                self.child_removed(literal!("scen"), ArcStr::from(sid));
                self.announce_persist_changed();
                Ok(())
            }
        }
    }

    /// Snapshot the union of persistable properties. During a
    /// transition the final values stand in for the instantaneous
    /// ones, so a snapshot always represents the post transition
    /// steady state.
    pub fn copy_persistent_state_now(&self) -> Snapshot {
        let mut snap = Snapshot::new();
        let finals: Option<IndexMap<ArcStr, Value>> = {
            let st = self.state.lock();
            st.transition.as_ref().map(|tr| tr.final_.clone())
        };
        for t in self.traits.iter() {
            for d in t.properties() {
                let name = d.key.name();
                if STRIPPED.contains(&name.as_str()) || !t.can_save(&d.key) {
                    continue;
                }
                let v = finals
                    .as_ref()
                    .and_then(|f| f.get(name).cloned())
                    .map(Ok)
                    .unwrap_or_else(|| t.get(&d.key));
                if let Ok(v) = v {
                    if !v.is_null() {
                        snap.insert(name.clone(), v);
                    }
                }
            }
        }
        {
            let st = self.state.lock();
            if !st.scenes.is_empty() {
                let mut scenes = IndexMap::new();
                for (id, s) in st.scenes.iter() {
                    scenes.insert(id.clone(), s.snapshot_value());
                }
                snap.insert(literal!("scenes"), scenes.into());
            }
        }
        for t in self.traits.iter() {
            for (k, v) in t.persist_children() {
                snap.insert(k, v);
            }
        }
        {
            let st = self.state.lock();
            for (k, v) in st.unknown_persist.iter() {
                snap.insert(k.clone(), v.clone());
            }
        }
        snap
    }

    /// Restore from a snapshot. Unknown keys are preserved for the
    /// next snapshot, reserved keys route to scenes and child
    /// managers, and the legacy `c/timr/acti` key is remapped.
    pub fn init_with_persistent_state_now(&self, snap: Snapshot) -> Result<()> {
        let mut props = PropertyBatch::new();
        for (k, v) in snap {
            let k = if k == "c/timr/acti" { literal!("c/acti/v") } else { k };
            if k == "scenes" {
                self.restore_scenes(&v);
                continue;
            }
            if self.by_prop.contains_key(&k) {
                props.insert(k, v);
                continue;
            }
            match self.traits.iter().find_map(|t| t.restore_child(&k, &v)) {
                Some(Ok(())) => (),
                Some(Err(e)) => {
                    log::warn!("{}: failed to restore child {k}: {e}", self.uid)
                }
                None => {
                    self.state.lock().unknown_persist.insert(k, v);
                }
            }
        }
        if let Err(e) = self.apply_properties_now(props, &[]) {
            log::warn!("{}: partial persistent state restore: {e}", self.uid)
        }
        Ok(())
    }

    fn restore_scenes(&self, v: &Value) {
        let scenes = match v.cast_map() {
            Ok(m) => m,
            Err(_) => {
                log::warn!("{}: malformed scenes snapshot", self.uid);
                return;
            }
        };
        for (id, stored) in scenes.iter() {
            match stored.cast_map() {
                Err(_) => log::warn!("{}: malformed scene {id}", self.uid),
                Ok(m) => {
                    let scene = Scene::new(
                        self.me.clone(),
                        id.clone(),
                        m.as_ref().clone(),
                        None,
                    );
                    let replaced = {
                        let mut st = self.state.lock();
                        st.scenes.insert(id.clone(), scene.clone()).is_some()
                    };
                    if !replaced {
                        self.child_added(literal!("scen"), id.clone(), scene as ArcThing);
                    }
                }
            }
        }
    }
}

fn mutate(m: Mutation, cur: &Value, arg: Value, name: &ArcStr) -> Result<Value> {
    let unsupported = || Error::PropertyOperationUnsupported(name.clone());
    match m {
        Mutation::Increment => match (cur, &arg) {
            (Value::I64(a), Value::I64(b)) => a
                .checked_add(*b)
                .map(Value::I64)
                .ok_or_else(|| Error::InvalidPropertyValue(name.clone())),
            (a, b) if a.is_number() && b.is_number() => {
                Ok(Value::F64(a.cast_f64()? + b.cast_f64()?))
            }
            (_, _) => Err(unsupported()),
        },
        Mutation::Toggle => match cur {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::I64(i) => Ok(Value::I64(if *i == 0 { 1 } else { 0 })),
            Value::F64(f) => Ok(Value::F64(if *f == 0. { 1. } else { 0. })),
            _ => Err(unsupported()),
        },
        Mutation::Insert => {
            let mut a = match cur {
                Value::Null => Vec::new(),
                Value::Array(a) => a.to_vec(),
                _ => return Err(unsupported()),
            };
            if !a.iter().any(|e| e.congruent(&arg)) {
                a.push(arg);
            }
            Ok(a.into())
        }
        Mutation::Remove => match cur {
            Value::Array(a) => {
                let a: Vec<Value> =
                    a.iter().filter(|e| !e.congruent(&arg)).cloned().collect();
                Ok(a.into())
            }
            _ => Err(unsupported()),
        },
    }
}

impl Thing for LocalThing {
    fn uid(&self) -> ArcStr {
        self.uid.clone()
    }

    fn local(&self) -> Option<&LocalThing> {
        Some(self)
    }

    fn set_property(&self, name: &str, value: Value, mods: &[Modifier]) -> Deferred<()> {
        deferred(self.set_property_now(name, value, mods))
    }

    fn fetch_property(&self, name: &str, mods: &[Modifier]) -> Deferred<Value> {
        deferred(self.fetch_property_now(name, mods))
    }

    fn fetch_section(&self, section: SectionKind, mods: &[Modifier]) -> Deferred<SectionMap> {
        deferred(Ok(self.fetch_section_now(section, mods)))
    }

    fn apply_properties(&self, props: PropertyBatch, mods: &[Modifier]) -> Deferred<()> {
        deferred(self.apply_properties_now(props, mods))
    }

    fn invoke_method(&self, name: &str, args: ArgMap) -> Deferred<Value> {
        deferred(self.invoke_now(name, &args))
    }

    fn register_property_listener(
        &self,
        exec: Exec,
        cb: PropertyCallback,
    ) -> Result<ListenerHandle> {
        Ok(self.register_property_listener_now(exec, cb))
    }

    fn register_section_listener(
        &self,
        section: SectionKind,
        exec: Exec,
        cb: SectionCallback,
    ) -> Result<ListenerHandle> {
        Ok(self.register_section_listener_now(section, exec, cb))
    }

    fn register_child_listener(
        &self,
        exec: Exec,
        cb: ChildCallback,
    ) -> Result<ListenerHandle> {
        Ok(self.register_child_listener_now(exec, cb))
    }

    fn copy_persistent_state(&self) -> Snapshot {
        self.copy_persistent_state_now()
    }

    fn init_with_persistent_state(&self, snap: Snapshot) -> Result<()> {
        self.init_with_persistent_state_now(snap)
    }
}
