use super::{args, fixture, light, settle};
use arcstr::ArcStr;
use splot_core::{thing::ArcThing, Error, SectionKind, Thing, Value};

#[tokio::test(start_paused = true)]
async fn create_allocates_monotonic_ids() {
    let f = fixture();
    let (id1, _) = f.timers.create_child(&args(&[])).unwrap();
    let (id2, _) = f.timers.create_child(&args(&[])).unwrap();
    assert_eq!(id1.as_str(), "1");
    assert_eq!(id2.as_str(), "2");
    // children are addressable through the parent's namespace
    let t = f.root.trait_child("timr", "1").unwrap();
    assert_eq!(t.uid().as_str(), "root.timr.1");
}

#[tokio::test(start_paused = true)]
async fn create_is_atomic_and_names_the_bad_parameter() {
    let f = fixture();
    let r = f.timers.create_child(&args(&[
        ("schd", Value::from("5")),
        ("bogus", Value::Bool(true)),
    ]));
    match r {
        Err(Error::InvalidMethodArguments(p)) => assert_eq!(p.as_str(), "bogus"),
        r => panic!("unexpected {r:?}"),
    }
    assert!(f.timers.children().is_empty());
}

#[tokio::test(start_paused = true)]
async fn create_through_the_method_namespace() {
    let f = fixture();
    let link = f.host.link("/1/f/timr?create").unwrap();
    let mut m = indexmap::IndexMap::new();
    m.insert(ArcStr::from("schd"), Value::from("30"));
    link.invoke(m.into()).await.unwrap();
    let timer = f.timers.child("1").unwrap();
    assert_eq!(
        timer.base().fetch_property_now("c/timr/schd", &[]).unwrap(),
        Value::from("30")
    );
}

#[tokio::test(start_paused = true)]
async fn nested_persistence_round_trips() {
    let f = fixture();
    let (_, timer) = f
        .timers
        .create_child(&args(&[
            ("schd", Value::from("60")),
            ("arst", Value::Bool(true)),
        ]))
        .unwrap();
    timer
        .base()
        .set_property_now("c/base/name", Value::from("night mode"), &[])
        .unwrap();
    let snap = f.root.copy_persistent_state_now();
    assert!(snap.contains_key("timr.1"));
    // restore into a fresh root with fresh managers
    let g = fixture();
    g.root.init_with_persistent_state_now(snap).unwrap();
    let restored = g.timers.child("1").unwrap();
    assert_eq!(
        restored.base().fetch_property_now("c/timr/schd", &[]).unwrap(),
        Value::from("60")
    );
    assert_eq!(
        restored.base().fetch_property_now("c/base/name", &[]).unwrap(),
        Value::from("night mode")
    );
    // the id allocator resumes past restored ids
    let (id, _) = g.timers.create_child(&args(&[])).unwrap();
    assert_eq!(id.as_str(), "2");
}

#[tokio::test(start_paused = true)]
async fn group_manager_hosts_and_persists_groups() {
    let f = fixture();
    let l1 = light("l1");
    f.host.host(l1.clone() as ArcThing);
    let g = f.groups.create_group(ArcStr::from("kitchen")).unwrap();
    g.add_member(&(l1.clone() as ArcThing)).unwrap();
    // hosted under its group id locator
    let link = f.host.link("/g/kitchen/s/onof/v").unwrap();
    link.invoke(Value::Bool(true)).await.unwrap();
    settle().await;
    assert_eq!(l1.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    // the root snapshot nests the group under its reserved key
    let snap = f.root.copy_persistent_state_now();
    assert!(snap.contains_key("group-kitchen"));
    let g2 = fixture();
    let bulb = light("l1");
    g2.host.host(bulb.clone() as ArcThing);
    g2.root.init_with_persistent_state_now(snap).unwrap();
    let restored = g2.groups.group("kitchen").unwrap();
    assert_eq!(restored.member_uids(), vec![ArcStr::from("l1")]);
    // membership resolved against the new host
    restored
        .apply_properties(
            [(ArcStr::from("s/onof/v"), Value::Bool(true))].into_iter().collect(),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
}

#[tokio::test(start_paused = true)]
async fn deleted_children_disappear_from_the_namespace() {
    let f = fixture();
    let (id, _) = f.timers.create_child(&args(&[])).unwrap();
    assert!(f.root.trait_child("timr", &id).is_some());
    f.timers.delete_child(&id).unwrap();
    assert!(f.root.trait_child("timr", &id).is_none());
    assert!(matches!(
        f.timers.delete_child(&id),
        Err(Error::UnknownResource(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn manager_state_is_not_in_the_section_caches() {
    let f = fixture();
    f.timers.create_child(&args(&[])).unwrap();
    // managers contribute children, not properties
    let m = f.root.fetch_section_now(SectionKind::Config, &[]);
    assert!(m.get("c/timr/schd").is_none());
}
