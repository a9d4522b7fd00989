//! Per trait property and method dispatch.
//!
//! A trait implementation is a collection of callbacks keyed to its
//! declared properties and methods. The engine's expectations are
//! captured by [`ThingTrait`]; the mechanical value-table part that
//! generated glue would normally provide is [`StoredTrait`], which
//! the concrete traits in [`crate::traits`] wrap with their sanitize
//! and side effect specifics.
use crate::{
    error::{Error, Result},
    key::{MethodKey, PropFlag, PropertyKey, SectionKind},
    thing::{ArcThing, LocalThing},
};
use arcstr::ArcStr;
use enumflags2::BitFlags;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use splot_value::{Kind, Value};
use std::{
    fmt,
    sync::{Arc, OnceLock, Weak},
};

pub type ArgMap = IndexMap<ArcStr, Value>;

#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub key: PropertyKey,
    pub typ: Kind,
    pub flags: BitFlags<PropFlag>,
}

impl PropertyDef {
    pub fn readable(&self) -> bool {
        self.flags.intersects(
            PropFlag::Get
                | PropFlag::GetReq
                | PropFlag::OptGet
                | PropFlag::Req
                | PropFlag::Const,
        )
    }

    pub fn writable(&self) -> bool {
        !self.flags.contains(PropFlag::Const)
            && self.flags.intersects(
                PropFlag::Set | PropFlag::SetReq | PropFlag::OptSet | PropFlag::Req,
            )
    }

    /// Whether the value participates in persistence snapshots.
    /// Metadata is effectively constant after construction and is
    /// never persisted.
    pub fn persists(&self) -> bool {
        self.key.section() != SectionKind::Metadata
            && self.readable()
            && !self.flags.intersects(PropFlag::NoSave | PropFlag::Volatile)
    }

    /// Whether the value may be interpolated by a transition.
    pub fn transitions(&self) -> bool {
        self.key.section() == SectionKind::State
            && !self.flags.contains(PropFlag::NoTrans)
            && matches!(self.typ, Kind::Int | Kind::Real | Kind::Bool | Kind::Array)
    }
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub key: MethodKey,
    pub returns: Kind,
    pub required: bool,
}

/// The upward handle a trait receives at registration, used to
/// announce out of band property changes and child membership
/// changes to the owning Thing.
#[derive(Debug, Clone)]
pub struct TraitCallback {
    pub(crate) thing: Weak<LocalThing>,
}

impl TraitCallback {
    pub fn thing(&self) -> Option<Arc<LocalThing>> {
        self.thing.upgrade()
    }

    /// Announce a property change that did not flow through the
    /// normal write path.
    pub fn did_change_property(&self, key: &PropertyKey, value: Value) {
        if let Some(t) = self.thing.upgrade() {
            t.property_changed(key.name(), value)
        }
    }

    pub fn did_add_child(&self, trait_id: &ArcStr, id: &ArcStr, child: &ArcThing) {
        if let Some(t) = self.thing.upgrade() {
            t.child_added(trait_id.clone(), id.clone(), child.clone())
        }
    }

    pub fn did_remove_child(&self, trait_id: &ArcStr, id: &ArcStr) {
        if let Some(t) = self.thing.upgrade() {
            t.child_removed(trait_id.clone(), id.clone())
        }
    }
}

/// A named group of related properties and methods with a stable
/// short id. The owning Thing routes property and method operations
/// here by key.
pub trait ThingTrait: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    fn short_id(&self) -> &'static str;

    fn uri(&self) -> &'static str;

    fn properties(&self) -> &[PropertyDef];

    fn methods(&self) -> &[MethodDef] {
        &[]
    }

    fn has_children(&self) -> bool {
        false
    }

    /// Called once when the trait is registered with its Thing.
    fn bind(&self, _cb: TraitCallback) {}

    fn get(&self, key: &PropertyKey) -> Result<Value>;

    /// Called with an already sanitized value.
    fn set(&self, key: &PropertyKey, value: Value) -> Result<()>;

    /// Pre set transform. The default coerces into the declared
    /// family.
    fn sanitize(&self, key: &PropertyKey, value: Value) -> Result<Value> {
        let def = self
            .property(key.name())
            .ok_or_else(|| Error::PropertyNotFound(key.name().clone()))?;
        value
            .coerce_kind(def.typ)
            .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))
    }

    fn property(&self, name: &ArcStr) -> Option<&PropertyDef> {
        self.properties().iter().find(|d| d.key.name() == name)
    }

    fn can_save(&self, key: &PropertyKey) -> bool {
        self.property(key.name()).map(|d| d.persists()).unwrap_or(false)
    }

    fn can_transition(&self, key: &PropertyKey) -> bool {
        self.property(key.name()).map(|d| d.transitions()).unwrap_or(false)
    }

    fn invoke(&self, key: &MethodKey, _args: &ArgMap) -> Result<Value> {
        Err(Error::MethodNotFound(key.name().clone()))
    }

    fn copy_children(&self) -> Vec<(ArcStr, ArcThing)> {
        Vec::new()
    }

    fn id_for_child(&self, _child: &ArcThing) -> Option<ArcStr> {
        None
    }

    fn child_by_id(&self, _id: &str) -> Option<ArcThing> {
        None
    }

    /// Persisted child snapshots, keyed by their reserved snapshot
    /// keys (e.g. `timr.3`, `group-<uid>`).
    fn persist_children(&self) -> IndexMap<ArcStr, Value> {
        IndexMap::new()
    }

    /// Offer a reserved snapshot key to this trait during restore.
    /// `Some` means the key was recognized (successfully restored or
    /// not); `None` passes it to the next trait.
    fn restore_child(&self, _key: &str, _snap: &Value) -> Option<Result<()>> {
        None
    }
}

/// Declare a property definition table.
///
/// ```ignore
/// let defs = propdefs![
///     (State, "onof", "v", Bool, Get | Set | Req | Change),
/// ];
/// ```
#[macro_export]
macro_rules! propdefs {
    ($(($section:ident, $tr:literal, $leaf:literal, $typ:ident, $($flag:ident)|+)),* $(,)?) => {
        vec![$(
            $crate::dispatch::PropertyDef {
                key: $crate::key::PropertyKey::new(
                    $crate::key::SectionKind::$section,
                    arcstr::literal!($tr),
                    arcstr::literal!($leaf),
                ),
                typ: $crate::Kind::$typ,
                flags: ($($crate::key::PropFlag::$flag)|+).into(),
            }
        ),*]
    };
}

/// The mechanical part of a trait implementation: a table of stored
/// values behind the declared property defs, with flag enforcement
/// and declared type coercion. Concrete traits delegate to this and
/// add their own behavior on top.
#[derive(Debug)]
pub struct StoredTrait {
    defs: Vec<PropertyDef>,
    values: Mutex<FxHashMap<ArcStr, Value>>,
    cb: OnceLock<TraitCallback>,
}

impl StoredTrait {
    pub fn new(defs: Vec<PropertyDef>) -> Self {
        StoredTrait { defs, values: Mutex::new(FxHashMap::default()), cb: OnceLock::new() }
    }

    pub fn with_values(
        defs: Vec<PropertyDef>,
        init: impl IntoIterator<Item = (ArcStr, Value)>,
    ) -> Self {
        let t = Self::new(defs);
        {
            let mut values = t.values.lock();
            for (k, v) in init {
                values.insert(k, v);
            }
        }
        t
    }

    pub fn defs(&self) -> &[PropertyDef] {
        &self.defs
    }

    pub fn bind(&self, cb: TraitCallback) {
        let _ = self.cb.set(cb);
    }

    pub fn callback(&self) -> Option<&TraitCallback> {
        self.cb.get()
    }

    pub fn def(&self, key: &PropertyKey) -> Result<&PropertyDef> {
        self.defs
            .iter()
            .find(|d| d.key == *key)
            .ok_or_else(|| Error::PropertyNotFound(key.name().clone()))
    }

    pub fn key_of(&self, name: &str) -> Option<&PropertyKey> {
        self.defs.iter().find(|d| d.key.name() == name).map(|d| &d.key)
    }

    /// Flag checked read. Missing values read as null.
    pub fn raw_get(&self, key: &PropertyKey) -> Result<Value> {
        let d = self.def(key)?;
        if !d.readable() {
            return Err(Error::PropertyWriteOnly(key.name().clone()));
        }
        Ok(self.values.lock().get(key.name()).cloned().unwrap_or(Value::Null))
    }

    /// Flag checked write. Null removes the stored entry.
    pub fn raw_set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        let d = self.def(key)?;
        if !d.writable() {
            return Err(Error::PropertyReadOnly(key.name().clone()));
        }
        self.store(key, value);
        Ok(())
    }

    /// Unconditional store, bypassing flag checks. For trait
    /// internal updates.
    pub fn store(&self, key: &PropertyKey, value: Value) {
        let mut values = self.values.lock();
        if value.is_null() {
            values.remove(key.name());
        } else {
            values.insert(key.name().clone(), value);
        }
    }

    /// Unconditional read, bypassing flag checks.
    pub fn peek(&self, key: &PropertyKey) -> Value {
        self.values.lock().get(key.name()).cloned().unwrap_or(Value::Null)
    }

    /// Store and announce an out of band change upward.
    pub fn store_and_announce(&self, key: &PropertyKey, value: Value) {
        self.store(key, value.clone());
        if let Some(cb) = self.cb.get() {
            cb.did_change_property(key, value)
        }
    }
}
