//! Groups: things whose state operations fan out across member
//! things and aggregate replies.
//!
//! Members are held strongly only while the group is hosted; a member
//! known only by uid resolves when its thing is hosted alongside the
//! group. Non state operations fall back to the group's own base
//! thing.
use crate::{
    deferred,
    dispatch::{ArgMap, PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::{Error, Result},
    exec::Exec,
    host::{Host, WeakHost},
    key::{Modifier, PropertyKey, SectionKind},
    thing::{
        ArcThing, ChildCallback, ListenerHandle, LocalThing, PropertyBatch,
        PropertyCallback, SectionCallback, SectionMap, Snapshot, Thing,
    },
    Deferred,
};
use crate::propdefs;
use arcstr::ArcStr;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use splot_value::Value;
use std::{
    fmt,
    sync::{Arc, Weak},
};

struct Member {
    uid: ArcStr,
    thing: Option<ArcThing>,
}

pub struct Group {
    me: Weak<Group>,
    base: Arc<LocalThing>,
    members: Mutex<Vec<Member>>,
    host: Mutex<WeakHost>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({})", self.base.uid())
    }
}

impl Group {
    pub fn new(uid: impl Into<ArcStr>, exec: Option<Exec>) -> Arc<Group> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<Group>| {
            let mut b = LocalThing::builder()
                .uid(uid.clone())
                .with_trait(Arc::new(GroupTrait::new(me.clone())));
            if let Some(exec) = exec {
                b = b.executor(exec);
            }
            Group {
                me: me.clone(),
                base: b.build(),
                members: Mutex::new(Vec::new()),
                host: Mutex::new(WeakHost::dead()),
            }
        })
    }

    /// The group id, which is also the thing uid and the `g/<id>`
    /// locator.
    pub fn group_id(&self) -> ArcStr {
        self.base.uid().clone()
    }

    pub fn base(&self) -> &Arc<LocalThing> {
        &self.base
    }

    /// Join a member thing directly. A native group may not join
    /// another native group.
    pub fn add_member(&self, t: &ArcThing) -> Result<()> {
        if t.is_native_group() {
            return Err(Error::InvalidPropertyValue(arcstr::literal!("c/grup/memb")));
        }
        let mut members = self.members.lock();
        let uid = t.uid();
        if members.iter().any(|m| m.uid == uid) {
            return Ok(());
        }
        members.push(Member { uid, thing: Some(t.clone()) });
        Ok(())
    }

    /// Join a member by uid; it resolves when hosted.
    pub fn add_member_uid(&self, uid: ArcStr) {
        {
            let mut members = self.members.lock();
            if members.iter().any(|m| m.uid == uid) {
                return;
            }
            members.push(Member { uid, thing: None });
        }
        self.resolve_members();
    }

    pub fn remove_member(&self, uid: &str) {
        self.members.lock().retain(|m| m.uid != uid);
    }

    pub fn member_uids(&self) -> Vec<ArcStr> {
        self.members.lock().iter().map(|m| m.uid.clone()).collect()
    }

    fn member_things(&self) -> Vec<ArcThing> {
        self.members.lock().iter().filter_map(|m| m.thing.clone()).collect()
    }

    fn set_member_uids(&self, uids: Vec<ArcStr>) {
        {
            let mut members = self.members.lock();
            members.retain(|m| uids.contains(&m.uid));
            for uid in uids {
                if !members.iter().any(|m| m.uid == uid) {
                    members.push(Member { uid, thing: None });
                }
            }
        }
        self.resolve_members();
    }

    fn resolve_members(&self) {
        let host = self.host.lock().clone();
        let host = match host.upgrade() {
            None => return,
            Some(h) => h,
        };
        let mut members = self.members.lock();
        for m in members.iter_mut() {
            if m.thing.is_none() {
                if let Some(t) = host.by_uid(&m.uid) {
                    if t.is_native_group() {
                        log::warn!(
                            "group {}: member {} is a native group, skipped",
                            self.base.uid(),
                            m.uid
                        );
                    } else {
                        m.thing = Some(t)
                    }
                }
            }
        }
    }

    fn split_state(props: PropertyBatch) -> (PropertyBatch, PropertyBatch) {
        let mut state = PropertyBatch::new();
        let mut other = PropertyBatch::new();
        for (k, v) in props {
            if k.starts_with("s/") {
                state.insert(k, v);
            } else {
                other.insert(k, v);
            }
        }
        (state, other)
    }

    /// Fan-in aggregation: a key present in every member with
    /// identical values keeps the value, differing values become
    /// null, keys missing anywhere are omitted. With `all`, the
    /// union of keys is returned with null standing in for
    /// disagreement or absence.
    async fn aggregate_state(
        members: Vec<ArcThing>,
        mods: Vec<Modifier>,
    ) -> SectionMap {
        let all = Modifier::wants_all(&mods);
        let futs: Vec<_> = members
            .iter()
            .map(|m| m.fetch_section(SectionKind::State, &mods))
            .collect();
        let mut maps = Vec::new();
        for r in join_all(futs).await {
            match r {
                Ok(m) => maps.push(m),
                Err(e) => log::warn!("group fan-in: member fetch failed: {e}"),
            }
        }
        let n = maps.len();
        let mut counts: IndexMap<ArcStr, (Value, usize, bool)> = IndexMap::new();
        for m in maps.iter() {
            for (k, v) in m.into_iter() {
                match counts.get_mut(k) {
                    None => {
                        counts.insert(k.clone(), (v.clone(), 1, true));
                    }
                    Some((first, seen, same)) => {
                        *seen += 1;
                        if !first.identical(v) {
                            *same = false
                        }
                    }
                }
            }
        }
        let mut out = SectionMap::new();
        for (k, (v, seen, same)) in counts {
            if seen == n && same {
                out.insert_cow(k, v);
            } else if seen == n || all {
                out.insert_cow(k, Value::Null);
            }
            // present in only some members and not in all mode:
            // omitted
        }
        out
    }
}

impl Thing for Group {
    fn uid(&self) -> ArcStr {
        self.base.uid().clone()
    }

    fn local(&self) -> Option<&LocalThing> {
        Some(&self.base)
    }

    fn is_native_group(&self) -> bool {
        true
    }

    fn set_property(&self, name: &str, value: Value, mods: &[Modifier]) -> Deferred<()> {
        if !name.starts_with("s/") {
            return deferred(self.base.set_property_now(name, value, mods));
        }
        let members = self.member_things();
        let name = ArcStr::from(name);
        let mods = mods.to_vec();
        Box::pin(async move {
            let futs: Vec<_> = members
                .iter()
                .map(|m| m.set_property(&name, value.clone(), &mods))
                .collect();
            for r in join_all(futs).await {
                if let Err(e) = r {
                    log::warn!("group fan-out: member write failed: {e}")
                }
            }
            Ok(())
        })
    }

    fn fetch_property(&self, name: &str, mods: &[Modifier]) -> Deferred<Value> {
        if !name.starts_with("s/") {
            return self.base.fetch_property(name, mods);
        }
        let members = self.member_things();
        let name = ArcStr::from(name);
        let mods = mods.to_vec();
        Box::pin(async move {
            let m = Group::aggregate_state(members, mods).await;
            Ok(m.get(&name).cloned().unwrap_or(Value::Null))
        })
    }

    fn fetch_section(&self, section: SectionKind, mods: &[Modifier]) -> Deferred<SectionMap> {
        if section != SectionKind::State {
            return self.base.fetch_section(section, mods);
        }
        let members = self.member_things();
        let mods = mods.to_vec();
        Box::pin(async move { Ok(Group::aggregate_state(members, mods).await) })
    }

    fn apply_properties(&self, props: PropertyBatch, mods: &[Modifier]) -> Deferred<()> {
        let (state, other) = Group::split_state(props);
        let base_res = if other.is_empty() {
            Ok(())
        } else {
            self.base.apply_properties_now(other, mods)
        };
        if state.is_empty() {
            return deferred(base_res);
        }
        let members = self.member_things();
        let mods = mods.to_vec();
        Box::pin(async move {
            let futs: Vec<_> = members
                .iter()
                .map(|m| m.apply_properties(state.clone(), &mods))
                .collect();
            // best effort broadcast: individual failures co-exist
            // with successes
            for r in join_all(futs).await {
                if let Err(e) = r {
                    log::warn!("group fan-out: member apply failed: {e}")
                }
            }
            base_res
        })
    }

    fn invoke_method(&self, name: &str, args: ArgMap) -> Deferred<Value> {
        self.base.invoke_method(name, args)
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
        self.resolve_members();
    }

    /// Unhosting drops the strong member references; the uids stay
    /// so rehosting can resolve them again.
    fn detached(&self) {
        let mut members = self.members.lock();
        for m in members.iter_mut() {
            m.thing = None
        }
    }

    fn peer_hosted(&self, peer: &ArcThing) {
        let uid = peer.uid();
        let mut members = self.members.lock();
        for m in members.iter_mut() {
            if m.uid == uid && m.thing.is_none() && !peer.is_native_group() {
                m.thing = Some(peer.clone())
            }
        }
    }
}

/// The group membership trait: the member uid list as config, with
/// join/leave methods.
#[derive(Debug)]
pub(crate) struct GroupTrait {
    group: Weak<Group>,
    store: StoredTrait,
}

impl GroupTrait {
    fn new(group: Weak<Group>) -> Self {
        GroupTrait {
            group,
            store: StoredTrait::new(propdefs![
                (Config, "grup", "memb", Array, Get | Set),
            ]),
        }
    }
}

impl ThingTrait for GroupTrait {
    fn name(&self) -> &'static str {
        "Group"
    }

    fn short_id(&self) -> &'static str {
        "grup"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:group"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.def(key)?;
        let g = self
            .group
            .upgrade()
            .ok_or_else(|| Error::BadStateForPropertyValue(key.name().clone()))?;
        let uids: Vec<Value> =
            g.member_uids().into_iter().map(Value::String).collect();
        if uids.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(uids.into())
        }
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        self.store.def(key)?;
        let g = self
            .group
            .upgrade()
            .ok_or_else(|| Error::BadStateForPropertyValue(key.name().clone()))?;
        let uids = match value {
            Value::Null => Vec::new(),
            v => v
                .cast_array()
                .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?
                .iter()
                .map(|e| {
                    e.cast_str()
                        .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))
                })
                .collect::<Result<Vec<ArcStr>>>()?,
        };
        g.set_member_uids(uids);
        Ok(())
    }
}
