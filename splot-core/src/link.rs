//! Resource links.
//!
//! A [`ResourceLink`] is an opaque handle to a single addressable
//! quantity: the value read, the operation performed on invoke, and
//! an observer registration relaying value changes. Concrete links
//! hold a weak reference to their target thing so unhosting frees it.
//! A [`LazyResourceLink`] stands in for a target that is not yet
//! hosted; it records the last attempted invoke argument and replays
//! it exactly once when the target appears.
use crate::{
    deferred,
    error::{Error, Result},
    exec::Exec,
    host::WeakHost,
    key::{Modifier, SectionKind},
    thing::{ArcThing, ListenerHandle, PropertyBatch, Thing},
    uri::Target,
    Deferred,
};
use arcstr::ArcStr;
use parking_lot::Mutex;
use splot_value::Value;
use std::{
    fmt,
    sync::{Arc, Weak},
};

pub type LinkCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// An observer registration on a link. Dropping it removes the
/// observer; when the last observer goes the link unhooks from its
/// thing.
pub struct Observation {
    _guard: Box<dyn std::any::Any + Send + Sync>,
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observation")
    }
}

pub trait ResourceLink: Send + Sync + fmt::Debug {
    fn uri(&self) -> &ArcStr;

    fn fetch_value(&self) -> Deferred<Value>;

    fn invoke(&self, arg: Value) -> Deferred<()>;

    fn observe(&self, exec: Exec, cb: LinkCallback) -> Result<Observation>;
}

struct PropObservers {
    next: u64,
    entries: Vec<(u64, LinkCallback)>,
    upstream: Option<ListenerHandle>,
}

/// A link to one property, with the mutation intent baked in by the
/// modifier list it was constructed with.
pub(crate) struct PropertyLink {
    me: Weak<PropertyLink>,
    uri: ArcStr,
    thing: Weak<dyn Thing>,
    name: ArcStr,
    mods: Vec<Modifier>,
    observers: Mutex<PropObservers>,
}

impl fmt::Debug for PropertyLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyLink({})", self.uri)
    }
}

impl PropertyLink {
    pub(crate) fn new(
        uri: ArcStr,
        thing: &ArcThing,
        name: ArcStr,
        mods: Vec<Modifier>,
    ) -> Arc<PropertyLink> {
        Arc::new_cyclic(|me| PropertyLink {
            me: me.clone(),
            uri,
            thing: Arc::downgrade(thing),
            name,
            mods,
            observers: Mutex::new(PropObservers {
                next: 0,
                entries: Vec::new(),
                upstream: None,
            }),
        })
    }

    fn thing(&self) -> Result<ArcThing> {
        self.thing
            .upgrade()
            .ok_or_else(|| Error::UnassociatedResource(self.uri.clone()))
    }
}

struct PropObsGuard {
    link: Weak<PropertyLink>,
    id: u64,
}

impl Drop for PropObsGuard {
    fn drop(&mut self) {
        if let Some(link) = self.link.upgrade() {
            let mut obs = link.observers.lock();
            obs.entries.retain(|(id, _)| *id != self.id);
            if obs.entries.is_empty() {
                obs.upstream = None;
            }
        }
    }
}

impl ResourceLink for PropertyLink {
    fn uri(&self) -> &ArcStr {
        &self.uri
    }

    fn fetch_value(&self) -> Deferred<Value> {
        match self.thing() {
            Err(e) => deferred(Err(e)),
            Ok(t) => t.fetch_property(&self.name, &self.mods),
        }
    }

    fn invoke(&self, arg: Value) -> Deferred<()> {
        match self.thing() {
            Err(e) => deferred(Err(e)),
            Ok(t) => t.set_property(&self.name, arg, &self.mods),
        }
    }

    /// The first observer hooks a property listener on the target
    /// thing; dropping the last one unhooks it. Values matching this
    /// link's property are forwarded through.
    fn observe(&self, exec: Exec, cb: LinkCallback) -> Result<Observation> {
        let mut obs = self.observers.lock();
        if obs.upstream.is_none() {
            let t = self.thing()?;
            let me = self.me.clone();
            let name = self.name.clone();
            let handle = t.register_property_listener(
                exec,
                Arc::new(move |n: &ArcStr, v: &Value| {
                    if *n == name {
                        if let Some(link) = me.upgrade() {
                            let entries = link.observers.lock().entries.clone();
                            for (_, cb) in entries {
                                cb(v)
                            }
                        }
                    }
                }),
            )?;
            obs.upstream = Some(handle);
        }
        let id = obs.next;
        obs.next += 1;
        obs.entries.push((id, cb));
        Ok(Observation { _guard: Box::new(PropObsGuard { link: self.me.clone(), id }) })
    }
}

/// A link to a whole section: reads as a map value, invokes as a
/// bulk property write.
pub(crate) struct SectionLink {
    uri: ArcStr,
    thing: Weak<dyn Thing>,
    section: SectionKind,
    mods: Vec<Modifier>,
}

impl fmt::Debug for SectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionLink({})", self.uri)
    }
}

impl SectionLink {
    pub(crate) fn new(
        uri: ArcStr,
        thing: &ArcThing,
        section: SectionKind,
        mods: Vec<Modifier>,
    ) -> Arc<SectionLink> {
        Arc::new(SectionLink { uri, thing: Arc::downgrade(thing), section, mods })
    }

    fn thing(&self) -> Result<ArcThing> {
        self.thing
            .upgrade()
            .ok_or_else(|| Error::UnassociatedResource(self.uri.clone()))
    }
}

impl ResourceLink for SectionLink {
    fn uri(&self) -> &ArcStr {
        &self.uri
    }

    fn fetch_value(&self) -> Deferred<Value> {
        let section = self.section;
        let mods = self.mods.clone();
        match self.thing() {
            Err(e) => deferred(Err(e)),
            Ok(t) => Box::pin(async move {
                let m = t.fetch_section(section, &mods).await?;
                let mut out = indexmap::IndexMap::new();
                for (k, v) in m.into_iter() {
                    out.insert(k.clone(), v.clone());
                }
                Ok(out.into())
            }),
        }
    }

    fn invoke(&self, arg: Value) -> Deferred<()> {
        match self.thing() {
            Err(e) => deferred(Err(e)),
            Ok(t) => match arg.cast_map() {
                Err(_) => deferred(Err(Error::InvalidPropertyValue(self.uri.clone()))),
                Ok(m) => {
                    let props: PropertyBatch =
                        m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    t.apply_properties(props, &self.mods)
                }
            },
        }
    }

    fn observe(&self, _exec: Exec, _cb: LinkCallback) -> Result<Observation> {
        Err(Error::PropertyOperationUnsupported(self.uri.clone()))
    }
}

/// A link to a method: invoke calls it with the argument map.
pub(crate) struct MethodLink {
    uri: ArcStr,
    thing: Weak<dyn Thing>,
    method: ArcStr,
}

impl fmt::Debug for MethodLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodLink({})", self.uri)
    }
}

impl MethodLink {
    pub(crate) fn new(uri: ArcStr, thing: &ArcThing, method: ArcStr) -> Arc<MethodLink> {
        Arc::new(MethodLink { uri, thing: Arc::downgrade(thing), method })
    }
}

impl ResourceLink for MethodLink {
    fn uri(&self) -> &ArcStr {
        &self.uri
    }

    fn fetch_value(&self) -> Deferred<Value> {
        deferred(Err(Error::PropertyOperationUnsupported(self.uri.clone())))
    }

    fn invoke(&self, arg: Value) -> Deferred<()> {
        let t = match self.thing.upgrade() {
            None => return deferred(Err(Error::UnassociatedResource(self.uri.clone()))),
            Some(t) => t,
        };
        let args = match crate::uri::ResourcePath::parse_args(&arg) {
            Err(e) => return deferred(Err(e)),
            Ok(a) => a,
        };
        let method = self.method.clone();
        Box::pin(async move {
            t.invoke_method(&method, args).await?;
            Ok(())
        })
    }

    fn observe(&self, _exec: Exec, _cb: LinkCallback) -> Result<Observation> {
        Err(Error::PropertyOperationUnsupported(self.uri.clone()))
    }
}

struct LazyState {
    resolved: Option<Arc<dyn ResourceLink>>,
    pending: Option<Value>,
    observers: Vec<(u64, Exec, LinkCallback)>,
    next: u64,
    held: Vec<(u64, Observation)>,
}

/// A link whose target was not hosted at construction time. It
/// retries resolution on use, and the host pokes it whenever a new
/// thing is hosted.
pub struct LazyResourceLink {
    me: Weak<LazyResourceLink>,
    uri: ArcStr,
    host: WeakHost,
    state: Mutex<LazyState>,
}

impl fmt::Debug for LazyResourceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self.state.lock().resolved.is_some();
        write!(f, "LazyResourceLink({}, resolved: {resolved})", self.uri)
    }
}

impl LazyResourceLink {
    pub(crate) fn new(uri: ArcStr, host: WeakHost) -> Arc<LazyResourceLink> {
        Arc::new_cyclic(|me| LazyResourceLink {
            me: me.clone(),
            uri,
            host,
            state: Mutex::new(LazyState {
                resolved: None,
                pending: None,
                observers: Vec::new(),
                next: 0,
                held: Vec::new(),
            }),
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().resolved.is_some()
    }

    /// Attempt late binding. On first success any pending invoke is
    /// replayed once and queued observers are re-registered against
    /// the concrete link.
    pub(crate) fn try_resolve(&self) -> Option<Arc<dyn ResourceLink>> {
        {
            let st = self.state.lock();
            if let Some(l) = &st.resolved {
                return Some(Arc::clone(l));
            }
        }
        let host = self.host.upgrade()?;
        let link = host.make_concrete(&self.uri).ok()?;
        let (pending, observers) = {
            let mut st = self.state.lock();
            if let Some(l) = &st.resolved {
                return Some(Arc::clone(l));
            }
            st.resolved = Some(Arc::clone(&link));
            (st.pending.take(), std::mem::take(&mut st.observers))
        };
        if let Some(v) = pending {
            let fut = link.invoke(v);
            let uri = self.uri.clone();
            host.executor().spawn_boxed(Box::pin(async move {
                if let Err(e) = fut.await {
                    log::warn!("{uri}: replayed invoke failed: {e}")
                }
            }));
        }
        let mut held = Vec::new();
        for (id, exec, cb) in observers {
            match link.observe(exec, cb) {
                Ok(o) => held.push((id, o)),
                Err(e) => log::warn!("{}: late observe failed: {e}", self.uri),
            }
        }
        self.state.lock().held.extend(held);
        Some(link)
    }
}

struct LazyObsGuard {
    link: Weak<LazyResourceLink>,
    id: u64,
}

impl Drop for LazyObsGuard {
    fn drop(&mut self) {
        if let Some(link) = self.link.upgrade() {
            let mut st = link.state.lock();
            st.observers.retain(|(id, _, _)| *id != self.id);
            st.held.retain(|(id, _)| *id != self.id);
        }
    }
}

impl ResourceLink for LazyResourceLink {
    fn uri(&self) -> &ArcStr {
        &self.uri
    }

    fn fetch_value(&self) -> Deferred<Value> {
        match self.try_resolve() {
            Some(l) => l.fetch_value(),
            None => deferred(Err(Error::UnassociatedResource(self.uri.clone()))),
        }
    }

    fn invoke(&self, arg: Value) -> Deferred<()> {
        match self.try_resolve() {
            Some(l) => l.invoke(arg),
            None => {
                // record for replay at resolution; the caller sees
                // the pending failure indicator
                self.state.lock().pending = Some(arg);
                deferred(Err(Error::UnassociatedResource(self.uri.clone())))
            }
        }
    }

    fn observe(&self, exec: Exec, cb: LinkCallback) -> Result<Observation> {
        if let Some(l) = self.try_resolve() {
            return l.observe(exec, cb);
        }
        let mut st = self.state.lock();
        let id = st.next;
        st.next += 1;
        st.observers.push((id, exec, cb));
        Ok(Observation {
            _guard: Box::new(LazyObsGuard { link: self.me.clone(), id }),
        })
    }
}

/// Build the concrete link for a resolved path target.
pub(crate) fn concrete_link(
    uri: ArcStr,
    thing: &ArcThing,
    target: &Target,
    mods: Vec<Modifier>,
) -> Arc<dyn ResourceLink> {
    match target {
        Target::Property(k) => {
            PropertyLink::new(uri, thing, k.name().clone(), mods) as Arc<dyn ResourceLink>
        }
        Target::Section(s) => SectionLink::new(uri, thing, *s, mods),
        Target::Method { trait_id, method } => {
            let name = crate::key::MethodKey::new(trait_id.clone(), method.clone());
            MethodLink::new(uri, thing, name.name().clone())
        }
    }
}
