//! The scene layer.
//!
//! A scene is a named snapshot of the parent Thing's save eligible
//! state. Scenes are child things: `/1/f/scen/warm/s/lght/mire`
//! addresses the stored Mireds value inside the "warm" scene of
//! hosted thing 1. Recalling a scene is a plain write of
//! `s/scen/sid`, which the Thing base expands into a bulk property
//! write before the normal write path runs.
use crate::{
    deferred,
    dispatch::{ArgMap, MethodDef, PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::{Error, Result},
    key::{MethodKey, Modifier, PropertyKey, SectionKind},
    thing::{ArcThing, LocalThing, PropertyBatch, SectionMap, Snapshot, Thing},
    Deferred,
};
use crate::propdefs;
use arcstr::{literal, ArcStr};
use compact_str::format_compact;
use indexmap::IndexMap;
use parking_lot::Mutex;
use splot_value::Value;
use std::{
    fmt,
    sync::{Arc, Weak},
};

/// Reserved key inside a scene snapshot holding the optional group
/// id.
const GROUP_ID_KEY: &str = "group-id";

pub struct Scene {
    id: ArcStr,
    uid: ArcStr,
    parent: Weak<LocalThing>,
    group_id: Mutex<Option<ArcStr>>,
    values: Mutex<IndexMap<ArcStr, Value>>,
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scene({})", self.uid)
    }
}

impl Scene {
    pub(crate) fn new(
        parent: Weak<LocalThing>,
        id: ArcStr,
        mut stored: IndexMap<ArcStr, Value>,
        group_id: Option<ArcStr>,
    ) -> Arc<Scene> {
        let parent_uid = parent
            .upgrade()
            .map(|p| p.uid().clone())
            .unwrap_or_else(|| literal!("?"));
        let group_id = group_id.or_else(|| {
            stored
                .shift_remove(GROUP_ID_KEY)
                .and_then(|v| v.cast_str().ok())
        });
        Arc::new(Scene {
            uid: ArcStr::from(format_compact!("{parent_uid}:scen:{id}").as_str()),
            id,
            parent,
            group_id: Mutex::new(group_id),
            values: Mutex::new(stored),
        })
    }

    pub fn id(&self) -> &ArcStr {
        &self.id
    }

    pub fn parent(&self) -> Option<Arc<LocalThing>> {
        self.parent.upgrade()
    }

    pub fn group_id(&self) -> Option<ArcStr> {
        self.group_id.lock().clone()
    }

    pub fn set_group_id(&self, gid: Option<ArcStr>) {
        *self.group_id.lock() = gid;
    }

    /// A copy of the stored state map.
    pub fn stored(&self) -> IndexMap<ArcStr, Value> {
        self.values.lock().clone()
    }

    /// The persistence form: the stored map, with the group id under
    /// its reserved key when present.
    pub(crate) fn snapshot_value(&self) -> Value {
        let mut m = self.values.lock().clone();
        if let Some(gid) = self.group_id.lock().clone() {
            m.insert(ArcStr::from(GROUP_ID_KEY), Value::String(gid));
        }
        m.into()
    }

    /// Scenes capture state only; config and metadata are not
    /// scenable.
    fn store(&self, name: &str, value: Value) -> Result<()> {
        if !name.starts_with("s/") {
            return Err(Error::PropertyOperationUnsupported(ArcStr::from(name)));
        }
        let mut values = self.values.lock();
        if value.is_null() {
            values.shift_remove(name);
        } else {
            values.insert(ArcStr::from(name), value);
        }
        Ok(())
    }
}

impl Thing for Scene {
    fn uid(&self) -> ArcStr {
        self.uid.clone()
    }

    fn set_property(&self, name: &str, value: Value, _mods: &[Modifier]) -> Deferred<()> {
        deferred(self.store(name, value))
    }

    fn fetch_property(&self, name: &str, _mods: &[Modifier]) -> Deferred<Value> {
        let v = self.values.lock().get(name).cloned().unwrap_or(Value::Null);
        deferred(Ok(v))
    }

    fn fetch_section(&self, section: SectionKind, _mods: &[Modifier]) -> Deferred<SectionMap> {
        let mut m = SectionMap::new();
        if section == SectionKind::State {
            for (k, v) in self.values.lock().iter() {
                m.insert_cow(k.clone(), v.clone());
            }
        }
        deferred(Ok(m))
    }

    fn apply_properties(&self, props: PropertyBatch, _mods: &[Modifier]) -> Deferred<()> {
        let mut first_err = None;
        for (name, v) in props {
            if let Err(e) = self.store(&name, v) {
                if first_err.is_none() {
                    first_err = Some(e)
                }
            }
        }
        deferred(first_err.map_or(Ok(()), Err))
    }

    fn invoke_method(&self, name: &str, _args: ArgMap) -> Deferred<Value> {
        deferred(Err(Error::MethodNotFound(ArcStr::from(name))))
    }

    fn copy_persistent_state(&self) -> Snapshot {
        self.values.lock().clone()
    }

    fn init_with_persistent_state(&self, snap: Snapshot) -> Result<()> {
        *self.values.lock() = snap;
        Ok(())
    }
}

/// The scene trait registered on scene capable things: the `sid`
/// recall property, the save/del methods, and the scene children.
#[derive(Debug)]
pub struct SceneTrait {
    store: StoredTrait,
    methods: Vec<MethodDef>,
}

impl SceneTrait {
    pub fn new() -> Self {
        SceneTrait {
            store: StoredTrait::new(propdefs![
                (State, "scen", "sid", String, Get | Set | NoSave | NoTrans | Change),
            ]),
            methods: vec![
                MethodDef {
                    key: MethodKey::new(literal!("scen"), literal!("save")),
                    returns: splot_value::Kind::Null,
                    required: false,
                },
                MethodDef {
                    key: MethodKey::new(literal!("scen"), literal!("del")),
                    returns: splot_value::Kind::Null,
                    required: false,
                },
            ],
        }
    }
}

impl Default for SceneTrait {
    fn default() -> Self {
        Self::new()
    }
}

impl ThingTrait for SceneTrait {
    fn name(&self) -> &'static str {
        "Scene"
    }

    fn short_id(&self) -> &'static str {
        "scen"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:scene"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    fn has_children(&self) -> bool {
        true
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.raw_get(key)
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        self.store.raw_set(key, value)
    }

    fn invoke(&self, key: &MethodKey, args: &ArgMap) -> Result<Value> {
        let thing = self
            .store
            .callback()
            .and_then(|cb| cb.thing())
            .ok_or_else(|| Error::MethodNotFound(key.name().clone()))?;
        match key.leaf().as_str() {
            "save" => {
                let sid = args
                    .get("sid")
                    .and_then(|v| v.cast_str().ok())
                    .ok_or_else(|| Error::InvalidMethodArguments(literal!("sid")))?;
                let gid = args.get("gid").and_then(|v| v.cast_str().ok());
                thing.save_scene(sid, gid)?;
                Ok(Value::Null)
            }
            "del" => {
                let sid = args
                    .get("sid")
                    .and_then(|v| v.cast_str().ok())
                    .ok_or_else(|| Error::InvalidMethodArguments(literal!("sid")))?;
                thing.delete_scene(&sid)?;
                Ok(Value::Null)
            }
            _ => Err(Error::MethodNotFound(key.name().clone())),
        }
    }

    fn copy_children(&self) -> Vec<(ArcStr, ArcThing)> {
        match self.store.callback().and_then(|cb| cb.thing()) {
            None => Vec::new(),
            Some(t) => t
                .scenes()
                .into_iter()
                .map(|(id, s)| (id, s as ArcThing))
                .collect(),
        }
    }

    fn child_by_id(&self, id: &str) -> Option<ArcThing> {
        self.store
            .callback()
            .and_then(|cb| cb.thing())
            .and_then(|t| t.scene(id))
            .map(|s| s as ArcThing)
    }

    fn id_for_child(&self, child: &ArcThing) -> Option<ArcStr> {
        let uid = child.uid();
        self.store.callback().and_then(|cb| cb.thing()).and_then(|t| {
            t.scenes().into_iter().find(|(_, s)| s.uid() == uid).map(|(id, _)| id)
        })
    }
}
