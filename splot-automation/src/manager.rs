//! Child managers.
//!
//! A manager is a trait-with-children registered on a root thing. It
//! owns its children, allocates their ids from a monotonic counter,
//! nests their persistent state under `<short-id>.<child-id>` keys,
//! and exposes `create`/`del` methods. Creation is atomic: a failure
//! while applying creation parameters drops the half built child and
//! surfaces InvalidMethodArguments naming the offending parameter.
use arcstr::ArcStr;
use compact_str::format_compact;
use indexmap::IndexMap;
use parking_lot::Mutex;
use splot_core::{
    dispatch::{ArgMap, MethodDef, PropertyDef, ThingTrait, TraitCallback},
    thing::ArcThing,
    Error, Exec, Group, Kind, MethodKey, Result, Thing, Value, WeakHost,
};
use std::{
    fmt,
    sync::{Arc, OnceLock, Weak},
};

/// Deletes a child on behalf of the child itself (e.g. a timer whose
/// auto delete fired).
pub trait ChildReaper: Send + Sync + 'static {
    fn reap(&self, id: &ArcStr);
}

/// An automation object a [`ManagerTrait`] can own.
pub trait ManagedChild: Thing + Sized {
    const SHORT: &'static str;

    fn create(host: WeakHost, exec: Exec, uid: ArcStr) -> Arc<Self>;

    fn set_owner(&self, id: ArcStr, reaper: Weak<dyn ChildReaper>);

    fn as_thing(self: Arc<Self>) -> ArcThing;
}

struct MgrState<T> {
    children: IndexMap<ArcStr, Arc<T>>,
    next_id: u64,
}

pub struct ManagerTrait<T: ManagedChild> {
    me: Weak<ManagerTrait<T>>,
    host: WeakHost,
    exec: Exec,
    cb: OnceLock<TraitCallback>,
    methods: Vec<MethodDef>,
    state: Mutex<MgrState<T>>,
}

impl<T: ManagedChild> fmt::Debug for ManagerTrait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagerTrait({})", T::SHORT)
    }
}

impl<T: ManagedChild> ManagerTrait<T> {
    pub fn new(host: WeakHost, exec: Exec) -> Arc<ManagerTrait<T>> {
        Arc::new_cyclic(|me| ManagerTrait {
            me: me.clone(),
            host,
            exec,
            cb: OnceLock::new(),
            methods: vec![
                MethodDef {
                    key: MethodKey::new(
                        ArcStr::from(T::SHORT),
                        arcstr::literal!("create"),
                    ),
                    returns: Kind::String,
                    required: false,
                },
                MethodDef {
                    key: MethodKey::new(ArcStr::from(T::SHORT), arcstr::literal!("del")),
                    returns: Kind::Null,
                    required: false,
                },
            ],
            state: Mutex::new(MgrState { children: IndexMap::new(), next_id: 1 }),
        })
    }

    pub fn child(&self, id: &str) -> Option<Arc<T>> {
        self.state.lock().children.get(id).cloned()
    }

    pub fn children(&self) -> Vec<(ArcStr, Arc<T>)> {
        self.state
            .lock()
            .children
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn parent_uid(&self) -> ArcStr {
        self.cb
            .get()
            .and_then(|cb| cb.thing())
            .map(|t| t.uid().clone())
            .unwrap_or_else(|| arcstr::literal!("?"))
    }

    fn alloc_id(&self) -> ArcStr {
        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        ArcStr::from(format_compact!("{id}").as_str())
    }

    /// Each recognized parameter maps to a property assignment on the
    /// new child: full property names pass through, `acti` targets
    /// the shared action list, and bare leaves land in the child's
    /// own config.
    fn param_property(&self, param: &str) -> ArcStr {
        if param.contains('/') {
            ArcStr::from(param)
        } else if param == "acti" {
            arcstr::literal!("c/acti/v")
        } else {
            ArcStr::from(format_compact!("c/{}/{param}", T::SHORT).as_str())
        }
    }

    pub fn create_child(&self, args: &ArgMap) -> Result<(ArcStr, Arc<T>)> {
        let id = self.alloc_id();
        let uid = ArcStr::from(
            format_compact!("{}.{}.{id}", self.parent_uid(), T::SHORT).as_str(),
        );
        let child = T::create(self.host.clone(), self.exec.clone(), uid);
        let reaper: Weak<dyn ChildReaper> = self.me.clone();
        child.set_owner(id.clone(), reaper);
        for (param, v) in args.iter() {
            let prop = self.param_property(param);
            let local = child
                .local()
                .ok_or_else(|| Error::InvalidMethodArguments(param.clone()))?;
            if local.def(&prop).is_none() {
                // the half built child is dropped here, deleting it
                return Err(Error::InvalidMethodArguments(param.clone()));
            }
            local
                .set_property_now(&prop, v.clone(), &[])
                .map_err(|_| Error::InvalidMethodArguments(param.clone()))?;
        }
        self.state.lock().children.insert(id.clone(), child.clone());
        if let Some(cb) = self.cb.get() {
            cb.did_add_child(&ArcStr::from(T::SHORT), &id, &child.clone().as_thing())
        }
        Ok((id, child))
    }

    pub fn delete_child(&self, id: &str) -> Result<()> {
        let removed = self.state.lock().children.shift_remove(id);
        match removed {
            None => Err(Error::UnknownResource(ArcStr::from(id))),
            Some(c) => {
                c.detached();
                if let Some(cb) = self.cb.get() {
                    cb.did_remove_child(&ArcStr::from(T::SHORT), &ArcStr::from(id))
                }
                Ok(())
            }
        }
    }
}

impl<T: ManagedChild> ChildReaper for ManagerTrait<T> {
    fn reap(&self, id: &ArcStr) {
        if let Err(e) = self.delete_child(id) {
            log::warn!("{} manager: reap {id}: {e}", T::SHORT)
        }
    }
}

impl<T: ManagedChild> ThingTrait for ManagerTrait<T> {
    fn name(&self) -> &'static str {
        T::SHORT
    }

    fn short_id(&self) -> &'static str {
        T::SHORT
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:manager"
    }

    fn properties(&self) -> &[PropertyDef] {
        &[]
    }

    fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    fn has_children(&self) -> bool {
        true
    }

    fn bind(&self, cb: TraitCallback) {
        let _ = self.cb.set(cb);
    }

    fn get(&self, key: &splot_core::PropertyKey) -> Result<Value> {
        Err(Error::PropertyNotFound(key.name().clone()))
    }

    fn set(&self, key: &splot_core::PropertyKey, _value: Value) -> Result<()> {
        Err(Error::PropertyNotFound(key.name().clone()))
    }

    fn invoke(&self, key: &MethodKey, args: &ArgMap) -> Result<Value> {
        match key.leaf().as_str() {
            "create" => {
                let (id, _) = self.create_child(args)?;
                Ok(Value::String(id))
            }
            "del" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.cast_str().ok())
                    .ok_or_else(|| Error::InvalidMethodArguments(arcstr::literal!("id")))?;
                self.delete_child(&id)?;
                Ok(Value::Null)
            }
            _ => Err(Error::MethodNotFound(key.name().clone())),
        }
    }

    fn copy_children(&self) -> Vec<(ArcStr, ArcThing)> {
        self.children()
            .into_iter()
            .map(|(id, c)| (id, c.as_thing()))
            .collect()
    }

    fn id_for_child(&self, child: &ArcThing) -> Option<ArcStr> {
        let uid = child.uid();
        self.state
            .lock()
            .children
            .iter()
            .find(|(_, c)| c.uid() == uid)
            .map(|(id, _)| id.clone())
    }

    fn child_by_id(&self, id: &str) -> Option<ArcThing> {
        self.child(id).map(|c| c.as_thing())
    }

    fn persist_children(&self) -> IndexMap<ArcStr, Value> {
        let mut out = IndexMap::new();
        for (id, c) in self.children() {
            let key =
                ArcStr::from(format_compact!("{}.{id}", T::SHORT).as_str());
            out.insert(key, c.copy_persistent_state().into());
        }
        out
    }

    fn restore_child(&self, key: &str, snap: &Value) -> Option<Result<()>> {
        let prefix = format_compact!("{}.", T::SHORT);
        let id = key.strip_prefix(prefix.as_str())?;
        let r = (|| {
            let snap = snap
                .cast_map()
                .map_err(|_| Error::InvalidPropertyValue(ArcStr::from(key)))?;
            let id = ArcStr::from(id);
            let uid = ArcStr::from(
                format_compact!("{}.{}.{id}", self.parent_uid(), T::SHORT).as_str(),
            );
            let child = T::create(self.host.clone(), self.exec.clone(), uid);
            let reaper: Weak<dyn ChildReaper> = self.me.clone();
            child.set_owner(id.clone(), reaper);
            child.init_with_persistent_state(snap.as_ref().clone())?;
            {
                let mut st = self.state.lock();
                if let Ok(n) = id.parse::<u64>() {
                    if n >= st.next_id {
                        st.next_id = n + 1
                    }
                }
                st.children.insert(id.clone(), child.clone());
            }
            if let Some(cb) = self.cb.get() {
                cb.did_add_child(&ArcStr::from(T::SHORT), &id, &child.as_thing())
            }
            Ok(())
        })();
        Some(r)
    }
}

/// Groups are persisted under `group-<uid>` keys by their own
/// bespoke manager, which also hosts and unhosts them so the
/// `g/<id>` locator works.
pub struct GroupManagerTrait {
    host: WeakHost,
    exec: Exec,
    cb: OnceLock<TraitCallback>,
    methods: Vec<MethodDef>,
    groups: Mutex<IndexMap<ArcStr, Arc<Group>>>,
}

impl fmt::Debug for GroupManagerTrait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupManagerTrait")
    }
}

impl GroupManagerTrait {
    pub fn new(host: WeakHost, exec: Exec) -> Arc<GroupManagerTrait> {
        Arc::new(GroupManagerTrait {
            host,
            exec,
            cb: OnceLock::new(),
            methods: vec![
                MethodDef {
                    key: MethodKey::new(
                        arcstr::literal!("grup"),
                        arcstr::literal!("create"),
                    ),
                    returns: Kind::String,
                    required: false,
                },
                MethodDef {
                    key: MethodKey::new(arcstr::literal!("grup"), arcstr::literal!("del")),
                    returns: Kind::Null,
                    required: false,
                },
            ],
            groups: Mutex::new(IndexMap::new()),
        })
    }

    pub fn group(&self, gid: &str) -> Option<Arc<Group>> {
        self.groups.lock().get(gid).cloned()
    }

    pub fn create_group(&self, gid: ArcStr) -> Result<Arc<Group>> {
        {
            let groups = self.groups.lock();
            if groups.contains_key(&gid) {
                return Err(Error::InvalidMethodArguments(arcstr::literal!("gid")));
            }
        }
        let g = Group::new(gid.clone(), Some(self.exec.clone()));
        if let Some(host) = self.host.upgrade() {
            host.host(g.clone() as ArcThing);
        }
        self.groups.lock().insert(gid.clone(), g.clone());
        if let Some(cb) = self.cb.get() {
            cb.did_add_child(&arcstr::literal!("grup"), &gid, &(g.clone() as ArcThing))
        }
        Ok(g)
    }

    pub fn delete_group(&self, gid: &str) -> Result<()> {
        let removed = self.groups.lock().shift_remove(gid);
        match removed {
            None => Err(Error::UnknownResource(ArcStr::from(gid))),
            Some(g) => {
                if let Some(host) = self.host.upgrade() {
                    host.unhost(&(g as ArcThing));
                }
                if let Some(cb) = self.cb.get() {
                    cb.did_remove_child(&arcstr::literal!("grup"), &ArcStr::from(gid))
                }
                Ok(())
            }
        }
    }
}

impl ThingTrait for GroupManagerTrait {
    fn name(&self) -> &'static str {
        "GroupManager"
    }

    fn short_id(&self) -> &'static str {
        "grup"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:group-manager"
    }

    fn properties(&self) -> &[PropertyDef] {
        &[]
    }

    fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    fn has_children(&self) -> bool {
        true
    }

    fn bind(&self, cb: TraitCallback) {
        let _ = self.cb.set(cb);
    }

    fn get(&self, key: &splot_core::PropertyKey) -> Result<Value> {
        Err(Error::PropertyNotFound(key.name().clone()))
    }

    fn set(&self, key: &splot_core::PropertyKey, _value: Value) -> Result<()> {
        Err(Error::PropertyNotFound(key.name().clone()))
    }

    fn invoke(&self, key: &MethodKey, args: &ArgMap) -> Result<Value> {
        match key.leaf().as_str() {
            "create" => {
                let gid = args
                    .get("gid")
                    .and_then(|v| v.cast_str().ok())
                    .ok_or_else(|| {
                        Error::InvalidMethodArguments(arcstr::literal!("gid"))
                    })?;
                self.create_group(gid.clone())?;
                Ok(Value::String(gid))
            }
            "del" => {
                let gid = args
                    .get("gid")
                    .and_then(|v| v.cast_str().ok())
                    .ok_or_else(|| {
                        Error::InvalidMethodArguments(arcstr::literal!("gid"))
                    })?;
                self.delete_group(&gid)?;
                Ok(Value::Null)
            }
            _ => Err(Error::MethodNotFound(key.name().clone())),
        }
    }

    fn copy_children(&self) -> Vec<(ArcStr, ArcThing)> {
        self.groups
            .lock()
            .iter()
            .map(|(id, g)| (id.clone(), g.clone() as ArcThing))
            .collect()
    }

    fn id_for_child(&self, child: &ArcThing) -> Option<ArcStr> {
        let uid = child.uid();
        self.groups
            .lock()
            .iter()
            .find(|(_, g)| g.group_id() == uid)
            .map(|(id, _)| id.clone())
    }

    fn child_by_id(&self, id: &str) -> Option<ArcThing> {
        self.group(id).map(|g| g as ArcThing)
    }

    fn persist_children(&self) -> IndexMap<ArcStr, Value> {
        let mut out = IndexMap::new();
        for (_, g) in self.groups.lock().iter() {
            let key = ArcStr::from(format_compact!("group-{}", g.group_id()).as_str());
            out.insert(key, g.copy_persistent_state().into());
        }
        out
    }

    fn restore_child(&self, key: &str, snap: &Value) -> Option<Result<()>> {
        let gid = key.strip_prefix("group-")?;
        let r = (|| {
            let snap = snap
                .cast_map()
                .map_err(|_| Error::InvalidPropertyValue(ArcStr::from(key)))?;
            let g = self.create_group(ArcStr::from(gid))?;
            g.init_with_persistent_state(snap.as_ref().clone())?;
            Ok(())
        })();
        Some(r)
    }
}
