//! The hosting runtime: the table of hosted things, the URI link
//! factory with its weak cache, and the lazy link registry.
use crate::{
    error::{Error, Result},
    exec::Exec,
    link::{concrete_link, LazyResourceLink, ResourceLink},
    thing::ArcThing,
    uri::{Locator, ResourcePath},
};
use arcstr::ArcStr;
use derive_builder::Builder;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, Weak},
};

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct HostConfig {
    /// The executor listener callbacks and scheduled work default
    /// to.
    #[builder(default = "crate::exec::default_executor()")]
    pub exec: Exec,
}

impl HostConfig {
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    pub fn start(self) -> Host {
        Host(Arc::new(HostInner {
            exec: self.exec,
            state: Mutex::new(HostState {
                things: IndexMap::new(),
                by_uid: FxHashMap::default(),
                next_index: 1,
                links: FxHashMap::default(),
                lazy: Vec::new(),
            }),
        }))
    }
}

struct HostState {
    things: IndexMap<u32, ArcThing>,
    by_uid: FxHashMap<ArcStr, u32>,
    next_index: u32,
    links: FxHashMap<ArcStr, Weak<dyn ResourceLink>>,
    lazy: Vec<Weak<LazyResourceLink>>,
}

pub(crate) struct HostInner {
    exec: Exec,
    state: Mutex<HostState>,
}

/// A handle to the hosting runtime. Cloning is cheap; all clones see
/// the same table.
#[derive(Clone)]
pub struct Host(Arc<HostInner>);

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.0.state.lock();
        write!(f, "Host({} things)", st.things.len())
    }
}

#[derive(Clone)]
pub struct WeakHost(Weak<HostInner>);

impl fmt::Debug for WeakHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakHost")
    }
}

impl WeakHost {
    pub fn upgrade(&self) -> Option<Host> {
        self.0.upgrade().map(Host)
    }

    /// A weak host that never upgrades. For tests and detached
    /// automations.
    pub fn dead() -> WeakHost {
        WeakHost(Weak::new())
    }
}

impl Host {
    pub fn new() -> Host {
        HostConfig::builder().build().expect("default host config").start()
    }

    pub fn executor(&self) -> Exec {
        Arc::clone(&self.0.exec)
    }

    pub fn downgrade(&self) -> WeakHost {
        WeakHost(Arc::downgrade(&self.0))
    }

    /// Host a thing, assigning it the next index. Hosting scans the
    /// registered lazy links and resolves those that now succeed, and
    /// lets every already hosted thing see the newcomer.
    pub fn host(&self, t: ArcThing) -> u32 {
        let (idx, peers) = {
            let mut st = self.0.state.lock();
            let idx = st.next_index;
            st.next_index += 1;
            st.things.insert(idx, t.clone());
            st.by_uid.insert(t.uid(), idx);
            let peers: Vec<ArcThing> = st
                .things
                .values()
                .filter(|p| p.uid() != t.uid())
                .cloned()
                .collect();
            (idx, peers)
        };
        t.attached(self, idx);
        for p in peers {
            p.peer_hosted(&t)
        }
        let lazies: Vec<Arc<LazyResourceLink>> = {
            let mut st = self.0.state.lock();
            st.lazy.retain(|w| w.strong_count() > 0);
            st.lazy.iter().filter_map(|w| w.upgrade()).collect()
        };
        for l in lazies {
            l.try_resolve();
        }
        idx
    }

    pub fn unhost(&self, t: &ArcThing) {
        let removed = {
            let mut st = self.0.state.lock();
            match st.by_uid.remove(&t.uid()) {
                None => false,
                Some(idx) => {
                    st.things.shift_remove(&idx);
                    true
                }
            }
        };
        if removed {
            t.detached()
        }
    }

    pub fn thing(&self, index: u32) -> Option<ArcThing> {
        self.0.state.lock().things.get(&index).cloned()
    }

    pub fn by_uid(&self, uid: &str) -> Option<ArcThing> {
        let st = self.0.state.lock();
        st.by_uid.get(uid).and_then(|i| st.things.get(i)).cloned()
    }

    pub fn index_of(&self, t: &ArcThing) -> Option<u32> {
        self.0.state.lock().by_uid.get(&t.uid()).copied()
    }

    pub fn things(&self) -> Vec<(u32, ArcThing)> {
        self.0
            .state
            .lock()
            .things
            .iter()
            .map(|(i, t)| (*i, t.clone()))
            .collect()
    }

    /// Resolve a parsed path to its target thing, walking child
    /// traversal steps.
    pub fn resolve_path(&self, path: &ResourcePath) -> Result<ArcThing> {
        let root = match &path.locator {
            Locator::Index(i) => self.thing(*i),
            Locator::Group(gid) => self.by_uid(gid),
        }
        .ok_or_else(|| Error::UnknownResource(path.uri.clone()))?;
        let mut cur = root;
        for (trait_id, child_id) in path.traverse.iter() {
            cur = cur
                .child_by_id(trait_id, child_id)
                .ok_or_else(|| Error::UnknownResource(path.uri.clone()))?;
        }
        Ok(cur)
    }

    /// Build a concrete (non lazy) link, failing if the target is not
    /// hosted yet.
    pub(crate) fn make_concrete(&self, uri: &str) -> Result<Arc<dyn ResourceLink>> {
        let path = ResourcePath::parse(uri)?;
        let thing = self.resolve_path(&path)?;
        Ok(concrete_link(
            ArcStr::from(uri),
            &thing,
            &path.target,
            path.modifiers.clone(),
        ))
    }

    /// Produce the link for a URI. Links are cached weakly by URI; a
    /// target that is not hosted yet yields a lazy link that resolves
    /// when it appears.
    pub fn link(&self, uri: &str) -> Result<Arc<dyn ResourceLink>> {
        {
            let mut st = self.0.state.lock();
            st.links.retain(|_, w| w.strong_count() > 0);
            if let Some(l) = st.links.get(uri).and_then(|w| w.upgrade()) {
                return Ok(l);
            }
        }
        // malformed URIs fail deterministically and never become
        // lazy links
        let path = ResourcePath::parse(uri)?;
        let link: Arc<dyn ResourceLink> = match self.resolve_path(&path) {
            Ok(thing) => {
                concrete_link(path.uri.clone(), &thing, &path.target, path.modifiers)
            }
            Err(Error::UnknownResource(_)) | Err(Error::UnassociatedResource(_)) => {
                let l = LazyResourceLink::new(path.uri.clone(), self.downgrade());
                self.0.state.lock().lazy.push(Arc::downgrade(&l));
                l
            }
            Err(e) => return Err(e),
        };
        self.0
            .state
            .lock()
            .links
            .insert(ArcStr::from(uri), Arc::downgrade(&link));
        Ok(link)
    }
}

impl Default for Host {
    fn default() -> Self {
        Host::new()
    }
}
