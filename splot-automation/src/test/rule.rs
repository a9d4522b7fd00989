use super::{args, fixture, light, post_action, settle};
use arcstr::ArcStr;
use indexmap::IndexMap;
use splot_core::{thing::ArcThing, Value};

fn condition(uri: &str, predicate: &str) -> Value {
    let mut m = IndexMap::new();
    m.insert(ArcStr::from("u"), Value::from(uri));
    m.insert(ArcStr::from("p"), Value::from(predicate));
    m.into()
}

#[tokio::test(start_paused = true)]
async fn fires_once_per_satisfied_edge() {
    let f = fixture();
    let sensor = light("sensor");
    let bulb = light("bulb");
    f.host.host(sensor.clone() as ArcThing);
    f.host.host(bulb.clone() as ArcThing);
    let conds: Value = vec![condition("/2/s/levl/v", "v 0.5 >")].into();
    let (_, rule) = f
        .rules
        .create_child(&args(&[
            ("cond", conds),
            ("acti", post_action("/3/s/onof/v?tog")),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    // condition satisfied: the action fires once
    sensor.set_property_now("s/levl/v", Value::F64(0.7), &[]).unwrap();
    settle().await;
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(rule.count(), 1);
    // still satisfied: no continuous firing
    sensor.set_property_now("s/levl/v", Value::F64(0.8), &[]).unwrap();
    settle().await;
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
    assert_eq!(rule.count(), 1);
    // falling edge resets the gate, the next rise fires again
    sensor.set_property_now("s/levl/v", Value::F64(0.2), &[]).unwrap();
    settle().await;
    sensor.set_property_now("s/levl/v", Value::F64(0.9), &[]).unwrap();
    settle().await;
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
    assert_eq!(rule.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn match_mode_all_requires_every_condition() {
    let f = fixture();
    let a = light("a");
    let b = light("b");
    let bulb = light("bulb");
    f.host.host(a.clone() as ArcThing);
    f.host.host(b.clone() as ArcThing);
    f.host.host(bulb.clone() as ArcThing);
    let conds: Value = vec![
        condition("/2/s/onof/v", "v"),
        condition("/3/s/onof/v", "v"),
    ]
    .into();
    let (_, rule) = f
        .rules
        .create_child(&args(&[
            ("cond", conds),
            ("mtch", Value::from("all")),
            ("acti", post_action("/4/s/onof/v?tog")),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    a.set_property_now("s/onof/v", Value::Bool(true), &[]).unwrap();
    settle().await;
    assert_eq!(rule.count(), 0);
    b.set_property_now("s/onof/v", Value::Bool(true), &[]).unwrap();
    settle().await;
    assert_eq!(rule.count(), 1);
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
}

#[tokio::test(start_paused = true)]
async fn match_mode_any_fires_on_either() {
    let f = fixture();
    let a = light("a");
    let b = light("b");
    let bulb = light("bulb");
    f.host.host(a.clone() as ArcThing);
    f.host.host(b.clone() as ArcThing);
    f.host.host(bulb.clone() as ArcThing);
    let conds: Value = vec![
        condition("/2/s/onof/v", "v"),
        condition("/3/s/onof/v", "v"),
    ]
    .into();
    let (_, rule) = f
        .rules
        .create_child(&args(&[
            ("cond", conds),
            ("mtch", Value::from("any")),
            ("acti", post_action("/4/s/onof/v?tog")),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    b.set_property_now("s/onof/v", Value::Bool(true), &[]).unwrap();
    settle().await;
    assert_eq!(rule.count(), 1);
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(true));
}

#[tokio::test(start_paused = true)]
async fn bad_condition_program_rejects_at_assignment() {
    let f = fixture();
    let conds: Value = vec![condition("/2/s/levl/v", "v ++ 1")].into();
    assert!(f.rules.create_child(&args(&[("cond", conds)])).is_err());
    assert!(f.rules.children().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabled_rule_does_not_fire() {
    let f = fixture();
    let sensor = light("sensor");
    let bulb = light("bulb");
    f.host.host(sensor.clone() as ArcThing);
    f.host.host(bulb.clone() as ArcThing);
    let conds: Value = vec![condition("/2/s/levl/v", "v 0.5 >")].into();
    let (_, rule) = f
        .rules
        .create_child(&args(&[
            ("cond", conds),
            ("acti", post_action("/3/s/onof/v?tog")),
        ]))
        .unwrap();
    settle().await;
    sensor.set_property_now("s/levl/v", Value::F64(0.9), &[]).unwrap();
    settle().await;
    assert_eq!(rule.count(), 0);
    assert_eq!(bulb.fetch_property_now("s/onof/v", &[]).unwrap(), Value::Bool(false));
}
