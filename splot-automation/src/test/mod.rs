use crate::manager::{GroupManagerTrait, ManagerTrait};
use crate::{LocalPairing, LocalRule, LocalTimer};
use arcstr::ArcStr;
use indexmap::IndexMap;
use splot_core::{
    scene::SceneTrait,
    thing::ArcThing,
    traits::{LevelTrait, OnOffTrait},
    transition::TransitionTrait,
    Host, LocalThing, Value,
};
use std::{sync::Arc, time::Duration};
use tokio::time;

mod manager;
mod pairing;
mod rule;

pub(crate) struct Fixture {
    pub host: Host,
    pub root: Arc<LocalThing>,
    pub timers: Arc<ManagerTrait<LocalTimer>>,
    pub pairings: Arc<ManagerTrait<LocalPairing>>,
    pub rules: Arc<ManagerTrait<LocalRule>>,
    pub groups: Arc<GroupManagerTrait>,
}

/// A root thing carrying all four managers, hosted at index 1.
pub(crate) fn fixture() -> Fixture {
    let host = Host::new();
    let timers = ManagerTrait::<LocalTimer>::new(host.downgrade(), host.executor());
    let pairings = ManagerTrait::<LocalPairing>::new(host.downgrade(), host.executor());
    let rules = ManagerTrait::<LocalRule>::new(host.downgrade(), host.executor());
    let groups = GroupManagerTrait::new(host.downgrade(), host.executor());
    let root = LocalThing::builder()
        .uid("root")
        .with_trait(timers.clone())
        .with_trait(pairings.clone())
        .with_trait(rules.clone())
        .with_trait(groups.clone())
        .build();
    host.host(root.clone() as ArcThing);
    Fixture { host, root, timers, pairings, rules, groups }
}

pub(crate) fn light(uid: &str) -> Arc<LocalThing> {
    LocalThing::builder()
        .uid(uid)
        .with_trait(Arc::new(OnOffTrait::new()))
        .with_trait(Arc::new(LevelTrait::new()))
        .with_trait(Arc::new(TransitionTrait::new()))
        .with_trait(Arc::new(SceneTrait::new()))
        .build()
}

pub(crate) fn args(entries: &[(&str, Value)]) -> IndexMap<ArcStr, Value> {
    entries
        .iter()
        .map(|(k, v)| (ArcStr::from(*k), v.clone()))
        .collect()
}

pub(crate) fn post_action(path: &str) -> Value {
    let mut m = IndexMap::new();
    m.insert(ArcStr::from("p"), Value::from(path));
    m.insert(ArcStr::from("m"), Value::from("POST"));
    let v: Value = m.into();
    vec![v].into()
}

pub(crate) async fn settle() {
    time::sleep(Duration::from_millis(5)).await
}
