use crate::{
    scene::SceneTrait,
    thing::{ArcThing, PropertyBatch},
    traits::{LevelTrait, LightTrait, OnOffTrait},
    transition::TransitionTrait,
    Error, Group, Host, LocalThing, Modifier, SectionKind, Thing, Value,
};
use arcstr::ArcStr;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;

fn light(uid: &str) -> Arc<LocalThing> {
    LocalThing::builder()
        .uid(uid)
        .with_trait(Arc::new(OnOffTrait::new()))
        .with_trait(Arc::new(LevelTrait::new()))
        .with_trait(Arc::new(LightTrait::new()))
        .with_trait(Arc::new(TransitionTrait::new()))
        .with_trait(Arc::new(SceneTrait::new()))
        .build()
}

fn batch(entries: &[(&str, Value)]) -> PropertyBatch {
    entries
        .iter()
        .map(|(k, v)| (ArcStr::from(*k), v.clone()))
        .collect()
}

async fn settle() {
    time::sleep(Duration::from_millis(5)).await
}

#[tokio::test(start_paused = true)]
async fn property_round_trip_and_sanitize() {
    let t = light("rt");
    t.set_property_now("s/levl/v", Value::F64(1.7), &[]).unwrap();
    // sanitization clamped into the unit interval, and is idempotent
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(1.));
    t.set_property_now("s/levl/v", Value::from("0.25"), &[]).unwrap();
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.25));
    assert!(matches!(
        t.set_property_now("s/levl/v", Value::from("zero"), &[]),
        Err(Error::InvalidPropertyValue(_))
    ));
    assert!(matches!(
        t.set_property_now("s/none/v", Value::Bool(true), &[]),
        Err(Error::PropertyNotFound(_))
    ));
    assert!(matches!(
        t.set_property_now("m/base/uid", Value::from("x"), &[]),
        Err(Error::PropertyReadOnly(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn best_effort_apply_keeps_good_keys() {
    let t = light("be");
    let r = t.apply_properties_now(
        batch(&[("s/levl/v", Value::F64(0.4)), ("m/base/uid", Value::from("no"))]),
        &[],
    );
    assert!(matches!(r, Err(Error::PropertyReadOnly(_))));
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.4));
}

#[tokio::test(start_paused = true)]
async fn section_cache_and_listeners() {
    let t = light("cache");
    let seen: Arc<Mutex<Vec<ArcStr>>> = Arc::new(Mutex::new(Vec::new()));
    let sections = Arc::new(AtomicUsize::new(0));
    let snap_holder: Arc<Mutex<Option<crate::thing::SectionMap>>> =
        Arc::new(Mutex::new(None));
    let s = seen.clone();
    let _ph = t.register_property_listener_now(
        t.executor(),
        Arc::new(move |name, _v| s.lock().push(name.clone())),
    );
    let n = sections.clone();
    let sh = snap_holder.clone();
    let _sh = t.register_section_listener_now(
        SectionKind::State,
        t.executor(),
        Arc::new(move |_s, m| {
            n.fetch_add(1, Ordering::Relaxed);
            *sh.lock() = Some(m.clone());
        }),
    );
    settle().await;
    // synthetic initial notifications covered the current values
    assert!(seen.lock().iter().any(|n| n.as_str() == "s/levl/v"));
    assert!(sections.load(Ordering::Relaxed) >= 1);
    seen.lock().clear();
    t.set_property_now("s/levl/v", Value::F64(0.33), &[]).unwrap();
    settle().await;
    assert!(seen.lock().iter().any(|n| n.as_str() == "s/levl/v"));
    let m = t.fetch_section_now(SectionKind::State, &[]);
    assert_eq!(m.get("s/levl/v"), Some(&Value::F64(0.33)));
    let snap = snap_holder.lock().clone().unwrap();
    assert_eq!(snap.get("s/levl/v"), Some(&Value::F64(0.33)));
    // the all variant enumerates declared null keys too
    let all = t.fetch_section_now(SectionKind::State, &[Modifier::All]);
    assert_eq!(all.get("s/lght/mire"), Some(&Value::Null));
    assert!(m.get("s/lght/mire").is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_listener_cancels_synthetic_notification() {
    let t = light("drop");
    let fired = Arc::new(AtomicUsize::new(0));
    let n = fired.clone();
    let h = t.register_property_listener_now(
        t.executor(),
        Arc::new(move |_, _| {
            n.fetch_add(1, Ordering::Relaxed);
        }),
    );
    drop(h);
    settle().await;
    assert_eq!(fired.load(Ordering::Relaxed), 0);
    t.set_property_now("s/levl/v", Value::F64(0.9), &[]).unwrap();
    settle().await;
    assert_eq!(fired.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn mutations() {
    let t = light("mut");
    t.set_property_now("s/levl/v", Value::F64(0.2), &[]).unwrap();
    t.increment_property("s/levl/v", Value::F64(0.3)).unwrap();
    assert!(t
        .fetch_property_now("s/levl/v", &[])
        .unwrap()
        .congruent(&Value::F64(0.5)));
    t.toggle_property("s/onof/v").unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    t.toggle_property("s/onof/v").unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
    // increment on a boolean is unsupported
    assert!(matches!(
        t.increment_property("s/onof/v", Value::I64(1)),
        Err(Error::PropertyOperationUnsupported(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn scene_recall_is_idempotent() {
    let t = light("scene");
    t.apply_properties_now(
        batch(&[("s/levl/v", Value::F64(0.6)), ("s/onof/v", Value::Bool(true))]),
        &[],
    )
    .unwrap();
    t.save_scene(ArcStr::from("warm"), None).unwrap();
    t.set_property_now("s/levl/v", Value::F64(0.1), &[]).unwrap();
    for _ in 0..2 {
        t.set_property_now("s/scen/sid", Value::from("warm"), &[]).unwrap();
        assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.6));
        assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    }
    // the recall id is readable afterwards
    assert_eq!(
        t.fetch_property_now("s/scen/sid", &[]).unwrap(),
        Value::from("warm")
    );
    // other keys in the same write overlay the recalled state
    t.apply_properties_now(
        batch(&[("s/scen/sid", Value::from("warm")), ("s/levl/v", Value::F64(0.9))]),
        &[],
    )
    .unwrap();
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.9));
    // unknown scene ids are rejected
    assert!(matches!(
        t.set_property_now("s/scen/sid", Value::from("nope"), &[]),
        Err(Error::InvalidPropertyValue(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn scene_is_an_addressable_child() {
    let host = Host::new();
    let t = light("scl");
    t.set_property_now("s/levl/v", Value::F64(0.42), &[]).unwrap();
    t.save_scene(ArcStr::from("warm"), None).unwrap();
    let idx = host.host(t.clone() as ArcThing);
    assert_eq!(idx, 1);
    let link = host.link("/1/f/scen/warm/s/levl/v").unwrap();
    let v = link.fetch_value().await.unwrap();
    assert_eq!(v, Value::F64(0.42));
    // writing through the child interface mutates the stored map
    link.invoke(Value::F64(0.1)).await.unwrap();
    let scene = t.scene("warm").unwrap();
    assert_eq!(scene.stored().get("s/levl/v"), Some(&Value::F64(0.1)));
    // config is not scenable
    let bad = host.link("/1/f/scen/warm/c/base/name").unwrap();
    assert!(matches!(
        bad.invoke(Value::from("x")).await,
        Err(Error::PropertyOperationUnsupported(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn transition_on_couples_level(){
    let t = light("s1");
    t.set_property_now("s/levl/v", Value::F64(0.6), &[]).unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(true))]),
        &[Modifier::Duration(2.)],
    )
    .unwrap();
    // the hardware is pre-seeded at level zero, power on
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.));
    // the target is visible through the transition-target modifier
    assert_eq!(
        t.fetch_property_now("s/levl/v", &[Modifier::TransitionTarget]).unwrap(),
        Value::F64(0.6)
    );
    time::sleep(Duration::from_secs(1)).await;
    let mid = t
        .fetch_property_now("s/levl/v", &[])
        .unwrap()
        .cast_f64()
        .unwrap();
    assert!(mid > 0. && mid < 0.6, "mid level was {mid}");
    time::sleep(Duration::from_millis(1100)).await;
    assert!(!t.transition_in_progress());
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.6));
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(t.fetch_property_now("s/tran/d", &[]).unwrap(), Value::F64(0.));
    // S2: an immediate off afterwards leaves the level alone
    t.set_property_now("s/onof/v", Value::Bool(false), &[]).unwrap();
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.6));
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn transition_off_restores_level_in_final() {
    let t = light("off");
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(true)), ("s/levl/v", Value::F64(0.8))]),
        &[],
    )
    .unwrap();
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(false))]),
        &[Modifier::Duration(1.)],
    )
    .unwrap();
    time::sleep(Duration::from_millis(500)).await;
    // power holds while the level ramps down
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    let mid = t
        .fetch_property_now("s/levl/v", &[])
        .unwrap()
        .cast_f64()
        .unwrap();
    assert!(mid > 0. && mid < 0.8, "mid level was {mid}");
    time::sleep(Duration::from_millis(700)).await;
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
    // the pre-transition level is restored so reactivation resumes
    // at brightness
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.8));
}

#[tokio::test(start_paused = true)]
async fn transition_monotone_numeric() {
    let t = light("mono");
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(true)), ("s/levl/v", Value::F64(0.2))]),
        &[],
    )
    .unwrap();
    t.apply_properties_now(
        batch(&[("s/levl/v", Value::F64(0.9))]),
        &[Modifier::Duration(1.)],
    )
    .unwrap();
    let mut last = 0.2;
    for _ in 0..10 {
        time::sleep(Duration::from_millis(100)).await;
        let v = t
            .fetch_property_now("s/levl/v", &[])
            .unwrap()
            .cast_f64()
            .unwrap();
        assert!((0.2..=0.9).contains(&v), "observed {v} outside [0.2, 0.9]");
        assert!(v >= last - 1e-9, "level went backwards: {last} -> {v}");
        last = v;
    }
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.9));
}

#[tokio::test(start_paused = true)]
async fn transition_off_when_already_off_applies_immediately() {
    let t = light("noop");
    t.set_property_now("s/levl/v", Value::F64(0.5), &[]).unwrap();
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(false))]),
        &[Modifier::Duration(5.)],
    )
    .unwrap();
    assert!(!t.transition_in_progress());
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn transition_pause_resume() {
    let t = light("pause");
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(true)), ("s/levl/v", Value::F64(0.))]),
        &[],
    )
    .unwrap();
    t.apply_properties_now(
        batch(&[("s/levl/v", Value::F64(1.))]),
        &[Modifier::Duration(1.)],
    )
    .unwrap();
    time::sleep(Duration::from_millis(300)).await;
    t.pause_transition();
    let at_pause = t
        .fetch_property_now("s/levl/v", &[])
        .unwrap()
        .cast_f64()
        .unwrap();
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        t.fetch_property_now("s/levl/v", &[]).unwrap().cast_f64().unwrap(),
        at_pause
    );
    t.resume_transition();
    time::sleep(Duration::from_millis(600)).await;
    assert_eq!(t.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(1.));
}

#[tokio::test(start_paused = true)]
async fn lazy_link_resolves_on_hosting() {
    let host = Host::new();
    let link = host.link("/1/s/onof/v").unwrap();
    assert!(matches!(
        link.fetch_value().await,
        Err(Error::UnassociatedResource(_))
    ));
    // a pre-resolution invoke records its argument
    assert!(matches!(
        link.invoke(Value::Bool(true)).await,
        Err(Error::UnassociatedResource(_))
    ));
    let t = light("lazy");
    host.host(t.clone() as ArcThing);
    settle().await;
    // the pending invoke replayed once the target appeared
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    // a second hosting does not double-fire the replay
    t.set_property_now("s/onof/v", Value::Bool(false), &[]).unwrap();
    host.host(light("bystander") as ArcThing);
    settle().await;
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
    // the link now works directly
    link.invoke(Value::Bool(true)).await.unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(link.fetch_value().await.unwrap(), Value::Bool(true));
}

#[tokio::test(start_paused = true)]
async fn link_cache_is_weak_and_by_uri() {
    let host = Host::new();
    let t = light("cacheable");
    host.host(t as ArcThing);
    let a = host.link("/1/s/onof/v").unwrap();
    let b = host.link("/1/s/onof/v").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    let c = host.link("/1/s/levl/v").unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
}

#[tokio::test(start_paused = true)]
async fn property_link_observation_relays() {
    let host = Host::new();
    let t = light("obs");
    host.host(t.clone() as ArcThing);
    let link = host.link("/1/s/levl/v").unwrap();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let obs = link
        .observe(host.executor(), Arc::new(move |v| s.lock().push(v.clone())))
        .unwrap();
    settle().await;
    t.set_property_now("s/levl/v", Value::F64(0.7), &[]).unwrap();
    settle().await;
    assert!(seen.lock().iter().any(|v| *v == Value::F64(0.7)));
    // unrelated properties are filtered out
    let before = seen.lock().len();
    t.set_property_now("s/onof/v", Value::Bool(true), &[]).unwrap();
    settle().await;
    assert_eq!(seen.lock().len(), before);
    drop(obs);
    t.set_property_now("s/levl/v", Value::F64(0.1), &[]).unwrap();
    settle().await;
    assert!(!seen.lock().iter().any(|v| *v == Value::F64(0.1)));
}

#[tokio::test(start_paused = true)]
async fn toggle_through_mutation_link() {
    let host = Host::new();
    let t = light("tog");
    host.host(t.clone() as ArcThing);
    let link = host.link("/1/s/onof/v?tog").unwrap();
    link.invoke(Value::Null).await.unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    link.invoke(Value::Null).await.unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn method_link_invokes_save() {
    let host = Host::new();
    let t = light("mth");
    t.set_property_now("s/levl/v", Value::F64(0.77), &[]).unwrap();
    host.host(t.clone() as ArcThing);
    let link = host.link("/1/f/scen?save").unwrap();
    let mut args = indexmap::IndexMap::new();
    args.insert(ArcStr::from("sid"), Value::from("evening"));
    link.invoke(args.into()).await.unwrap();
    let scene = t.scene("evening").unwrap();
    assert_eq!(scene.stored().get("s/levl/v"), Some(&Value::F64(0.77)));
}

#[tokio::test(start_paused = true)]
async fn group_broadcast_and_aggregate() {
    let host = Host::new();
    let l1 = light("l1");
    let l2 = light("l2");
    host.host(l1.clone() as ArcThing);
    host.host(l2.clone() as ArcThing);
    let g = Group::new("kitchen", None);
    host.host(g.clone() as ArcThing);
    g.add_member(&(l1.clone() as ArcThing)).unwrap();
    g.add_member(&(l2.clone() as ArcThing)).unwrap();
    // S4: state broadcast
    g.apply_properties(batch(&[("s/onof/v", Value::Bool(true))]), &[])
        .await
        .unwrap();
    assert_eq!(l1.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(l2.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    // fan-in: identical values keep the value, differing become null
    l1.set_property_now("s/levl/v", Value::F64(0.3), &[]).unwrap();
    l2.set_property_now("s/levl/v", Value::F64(0.5), &[]).unwrap();
    let m = g.fetch_section(SectionKind::State, &[]).await.unwrap();
    assert_eq!(m.get("s/onof/v"), Some(&Value::Bool(true)));
    assert_eq!(m.get("s/levl/v"), Some(&Value::Null));
    // groups address through the g/ locator, fanning mutations out
    let link = host.link("/g/kitchen/s/onof/v?tog").unwrap();
    link.invoke(Value::Null).await.unwrap();
    settle().await;
    assert_eq!(l1.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
    assert_eq!(l2.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn group_members_resolve_when_hosted_later() {
    let host = Host::new();
    let g = Group::new("hall", None);
    host.host(g.clone() as ArcThing);
    g.add_member_uid(ArcStr::from("late"));
    g.apply_properties(batch(&[("s/onof/v", Value::Bool(true))]), &[])
        .await
        .unwrap();
    let t = light("late");
    host.host(t.clone() as ArcThing);
    g.apply_properties(batch(&[("s/onof/v", Value::Bool(true))]), &[])
        .await
        .unwrap();
    assert_eq!(t.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
}

#[tokio::test(start_paused = true)]
async fn native_group_nesting_is_rejected() {
    let g1 = Group::new("g1", None);
    let g2 = Group::new("g2", None);
    assert!(matches!(
        g1.add_member(&(g2 as ArcThing)),
        Err(Error::InvalidPropertyValue(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn persistence_round_trip() {
    let a = light("snap-a");
    a.apply_properties_now(
        batch(&[
            ("s/levl/v", Value::F64(0.45)),
            ("s/onof/v", Value::Bool(true)),
            ("c/base/name", Value::from("desk lamp")),
        ]),
        &[],
    )
    .unwrap();
    a.save_scene(ArcStr::from("warm"), None).unwrap();
    let mut snap = a.copy_persistent_state_now();
    // s/tran/d and s/scen/sid never appear in snapshots
    assert!(!snap.contains_key("s/tran/d"));
    assert!(!snap.contains_key("s/scen/sid"));
    // unknown keys and the legacy action key survive restore
    snap.insert(ArcStr::from("x/vendor/blob"), Value::I64(7));
    snap.insert(ArcStr::from("c/timr/acti"), Value::from("legacy"));
    let b = light("snap-b");
    b.init_with_persistent_state_now(snap).unwrap();
    assert_eq!(b.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.45));
    assert_eq!(b.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(
        b.fetch_property_now("c/base/name", &[]).unwrap(),
        Value::from("desk lamp")
    );
    assert_eq!(
        b.scene("warm").unwrap().stored().get("s/levl/v"),
        Some(&Value::F64(0.45))
    );
    let again = b.copy_persistent_state_now();
    assert_eq!(again.get("x/vendor/blob"), Some(&Value::I64(7)));
    assert_eq!(again.get("c/acti/v"), Some(&Value::from("legacy")));
    assert!(!again.contains_key("c/timr/acti"));
}

#[tokio::test(start_paused = true)]
async fn persistence_during_transition_snapshots_final() {
    let t = light("snapt");
    t.apply_properties_now(
        batch(&[("s/onof/v", Value::Bool(true)), ("s/levl/v", Value::F64(0.1))]),
        &[],
    )
    .unwrap();
    t.apply_properties_now(
        batch(&[("s/levl/v", Value::F64(1.))]),
        &[Modifier::Duration(10.)],
    )
    .unwrap();
    time::sleep(Duration::from_millis(200)).await;
    let snap = t.copy_persistent_state_now();
    assert_eq!(snap.get("s/levl/v"), Some(&Value::F64(1.)));
}

#[tokio::test(start_paused = true)]
async fn unhosting_frees_links() {
    let host = Host::new();
    let t = light("gone");
    host.host(t.clone() as ArcThing);
    let link = host.link("/1/s/onof/v").unwrap();
    link.invoke(Value::Bool(true)).await.unwrap();
    let arc: ArcThing = t.clone();
    host.unhost(&arc);
    drop(arc);
    drop(t);
    assert!(matches!(
        link.invoke(Value::Bool(false)).await,
        Err(Error::UnassociatedResource(_))
    ));
}
