use super::{args, fixture, light, settle};
use splot_core::{thing::ArcThing, Value};

#[tokio::test(start_paused = true)]
async fn push_propagates_once_per_distinct_value() {
    let f = fixture();
    let l1 = light("light1");
    let l2 = light("light2");
    f.host.host(l1.clone() as ArcThing);
    f.host.host(l2.clone() as ArcThing);
    let (_, pairing) = f
        .pairings
        .create_child(&args(&[
            ("src", Value::from("/2/s/levl/v")),
            ("dst", Value::from("/3/s/levl/v")),
            ("fwd", Value::from("v")),
            ("push", Value::Bool(true)),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    let baseline = pairing.count();
    l1.set_property_now("s/levl/v", Value::F64(0.5), &[]).unwrap();
    settle().await;
    assert_eq!(l2.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.5));
    assert_eq!(pairing.count(), baseline + 1);
    // the same value again does not re-invoke
    l1.set_property_now("s/levl/v", Value::F64(0.5), &[]).unwrap();
    settle().await;
    assert_eq!(pairing.count(), baseline + 1);
    // nor does a change within the source epsilon
    l1.set_property_now("s/levl/v", Value::F64(0.50005), &[]).unwrap();
    settle().await;
    assert_eq!(pairing.count(), baseline + 1);
    assert_eq!(l2.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.5));
}

#[tokio::test(start_paused = true)]
async fn forward_transform_applies() {
    let f = fixture();
    let l1 = light("light1");
    let l2 = light("light2");
    f.host.host(l1.clone() as ArcThing);
    f.host.host(l2.clone() as ArcThing);
    f.pairings
        .create_child(&args(&[
            ("src", Value::from("/2/s/levl/v")),
            ("dst", Value::from("/3/s/levl/v")),
            ("fwd", Value::from("v 2 /")),
            ("push", Value::Bool(true)),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    l1.set_property_now("s/levl/v", Value::F64(0.8), &[]).unwrap();
    settle().await;
    assert!(l2
        .fetch_property_now("s/levl/v", &[])
        .unwrap()
        .congruent(&Value::F64(0.4)));
}

#[tokio::test(start_paused = true)]
async fn stop_transform_suppresses_emission() {
    let f = fixture();
    let l1 = light("light1");
    let l2 = light("light2");
    f.host.host(l1.clone() as ArcThing);
    f.host.host(l2.clone() as ArcThing);
    f.pairings
        .create_child(&args(&[
            ("src", Value::from("/2/s/levl/v")),
            ("dst", Value::from("/3/s/levl/v")),
            ("fwd", Value::from("v 0.5 > IF v ELSE STOP ENDIF")),
            ("push", Value::Bool(true)),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    l1.set_property_now("s/levl/v", Value::F64(0.2), &[]).unwrap();
    settle().await;
    assert_eq!(l2.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.));
    l1.set_property_now("s/levl/v", Value::F64(0.9), &[]).unwrap();
    settle().await;
    assert_eq!(l2.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.9));
}

#[tokio::test(start_paused = true)]
async fn pull_runs_the_reverse_transform() {
    let f = fixture();
    let l1 = light("light1");
    let l2 = light("light2");
    f.host.host(l1.clone() as ArcThing);
    f.host.host(l2.clone() as ArcThing);
    f.pairings
        .create_child(&args(&[
            ("src", Value::from("/2/s/levl/v")),
            ("dst", Value::from("/3/s/levl/v")),
            ("rev", Value::from("v 2 /")),
            ("pull", Value::Bool(true)),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    l2.set_property_now("s/levl/v", Value::F64(0.6), &[]).unwrap();
    settle().await;
    assert!(l1
        .fetch_property_now("s/levl/v", &[])
        .unwrap()
        .congruent(&Value::F64(0.3)));
}

#[tokio::test(start_paused = true)]
async fn destination_failure_publishes_push_trap() {
    let f = fixture();
    let l1 = light("light1");
    f.host.host(l1.clone() as ArcThing);
    let (_, pairing) = f
        .pairings
        .create_child(&args(&[
            ("src", Value::from("/2/s/levl/v")),
            // never hosted, the link stays lazy and unresolved
            ("dst", Value::from("/9/s/levl/v")),
            ("push", Value::Bool(true)),
            ("enab", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    l1.set_property_now("s/levl/v", Value::F64(0.4), &[]).unwrap();
    settle().await;
    let trap = pairing
        .base()
        .fetch_property_now("m/pair/ptrap", &[])
        .unwrap();
    assert_eq!(trap, Value::from("destination-write-fail"));
}

#[tokio::test(start_paused = true)]
async fn disabled_pairing_is_inert() {
    let f = fixture();
    let l1 = light("light1");
    let l2 = light("light2");
    f.host.host(l1.clone() as ArcThing);
    f.host.host(l2.clone() as ArcThing);
    let (_, pairing) = f
        .pairings
        .create_child(&args(&[
            ("src", Value::from("/2/s/levl/v")),
            ("dst", Value::from("/3/s/levl/v")),
            ("push", Value::Bool(true)),
        ]))
        .unwrap();
    settle().await;
    l1.set_property_now("s/levl/v", Value::F64(0.7), &[]).unwrap();
    settle().await;
    assert_eq!(l2.fetch_property_now("s/levl/v", &[]).unwrap(), Value::F64(0.));
    assert_eq!(pairing.count(), 0);
}
