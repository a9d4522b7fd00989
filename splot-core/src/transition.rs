//! The transition layer.
//!
//! A write whose effective duration is positive and that touches at
//! least one transitionable state property is intercepted between
//! sanitization and set. The engine snapshots `begin`, computes `end`
//! (the interpolation targets) and `final` (the values applied at
//! completion), then ticks on a capped schedule writing intermediate
//! values through the normal trait set path.
//!
//! The OnOff/Level coupling keeps bulbs flicker free: turning on
//! pre-seeds the hardware at level 0 with power on, then ramps the
//! level up; turning off holds power on while the level ramps down,
//! restoring the pre-transition level in `final` so the next
//! activation resumes at brightness.
use crate::{
    dispatch::{PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::Result,
    key::{PropertyKey, SectionKind},
    thing::{
        LocalThing, PropertyBatch, KEY_ONOFF, KEY_TRAN_D, STRIPPED,
    },
};
use crate::propdefs;
use arcstr::ArcStr;
use indexmap::IndexMap;
use splot_value::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Tick period bounds: aim for ~1000 samples, never faster than 20Hz
/// nor slower than 1Hz.
const TICK_MIN: Duration = Duration::from_millis(50);
const TICK_MAX: Duration = Duration::from_secs(1);

fn tick_period(total: Duration) -> Duration {
    (total / 1000).clamp(TICK_MIN, TICK_MAX)
}

pub(crate) struct Transition {
    pub(crate) begin: IndexMap<ArcStr, Value>,
    pub(crate) end: IndexMap<ArcStr, Value>,
    pub(crate) final_: IndexMap<ArcStr, Value>,
    pub(crate) t_begin: Instant,
    pub(crate) t_end: Instant,
    pub(crate) tick: Option<crate::exec::Scheduled>,
    /// whether the duration was explicit (modifier or s/tran/d) as
    /// opposed to a per thing default
    pub(crate) explicit: bool,
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Transition(end: {:?}, remaining: {:?})",
            self.end,
            self.t_end.saturating_duration_since(Instant::now())
        )
    }
}

fn lerp(a: f64, b: f64, p: f64) -> f64 {
    a + (b - a) * p
}

/// The intermediate value at progress `p`, or `None` for types that
/// only pass through at completion.
fn interpolate(b: &Value, e: &Value, p: f64) -> Option<Value> {
    match (b, e) {
        (Value::I64(b), Value::I64(e)) => {
            Some(Value::I64(lerp(*b as f64, *e as f64, p).round() as i64))
        }
        (b, e) if b.is_number() && e.is_number() => {
            let (b, e) = (b.as_f64()?, e.as_f64()?);
            Some(Value::F64(lerp(b, e, p)))
        }
        (b, Value::Bool(e)) => {
            // a monotonic switch at either end would flicker; hold
            // true while in flight unless both ends agree on false
            let b = b.cast_bool().unwrap_or(false);
            Some(Value::Bool((*e && !b) || p < 1.))
        }
        (Value::Array(b), Value::Array(e)) => {
            let n = b.len().min(e.len());
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (bv, ev) = (b[i].cast_f64().ok()?, e[i].cast_f64().ok()?);
                out.push(Value::F64(lerp(bv, ev, p)));
            }
            Some(out.into())
        }
        (_, _) => None,
    }
}

impl LocalThing {
    /// Start (or replace) a transition. Called from the write hook
    /// with the operation lock held; `trans` holds the transitionable
    /// state writes and `other` everything applied immediately.
    pub(crate) fn begin_transition(
        &self,
        trans: PropertyBatch,
        other: PropertyBatch,
        duration: f64,
        explicit: bool,
    ) -> Result<()> {
        let mut first_err = self.apply_now(other).err();
        // keep the duration readout in sync with the write
        if self.defs.contains_key(KEY_TRAN_D) {
            let mut b = PropertyBatch::new();
            b.insert(ArcStr::from(KEY_TRAN_D), Value::F64(duration));
            if let Err(e) = self.apply_now(b) {
                first_err.get_or_insert(e);
            }
        }
        let mut begin: IndexMap<ArcStr, Value> = IndexMap::new();
        {
            let st = self.state.lock();
            for (k, v) in st.caches[SectionKind::State.index()].into_iter() {
                if !STRIPPED.contains(&k.as_str()) {
                    begin.insert(k.clone(), v.clone());
                }
            }
        }
        let mut end = trans;
        let prior = { self.state.lock().transition.take() };
        let mut final_ = match prior {
            // a replacement driven purely by defaults keeps the
            // previous final and grafts the new end
            Some(p) if !explicit => {
                let mut f = p.final_;
                for (k, v) in end.iter() {
                    if !f.contains_key(k) {
                        f.insert(k.clone(), v.clone());
                    }
                }
                f
            }
            _ => end.clone(),
        };
        // OnOff/Level coupling
        if let Some(lk) = self.level_key.clone() {
            if end.contains_key(KEY_ONOFF) {
                let begin_on = begin
                    .get(KEY_ONOFF)
                    .and_then(|v| v.cast_bool().ok())
                    .unwrap_or(false);
                let final_on = final_
                    .get(KEY_ONOFF)
                    .and_then(|v| v.cast_bool().ok())
                    .unwrap_or(begin_on);
                let begin_level =
                    begin.get(&lk).and_then(|v| v.cast_f64().ok()).unwrap_or(0.);
                if !begin_on && !final_on {
                    // nothing visible to animate
                    let batch: PropertyBatch = final_.into_iter().collect();
                    if let Err(e) = self.apply_now(batch) {
                        first_err.get_or_insert(e);
                    }
                    if self.defs.contains_key(KEY_TRAN_D) {
                        let mut b = PropertyBatch::new();
                        b.insert(ArcStr::from(KEY_TRAN_D), Value::F64(0.));
                        let _ = self.apply_now(b);
                    }
                    return first_err.map_or(Ok(()), Err);
                } else if begin_on && !final_on {
                    // turning off: hold power, ramp the level to
                    // zero, restore it in final
                    end.insert(ArcStr::from(KEY_ONOFF), Value::Bool(true));
                    end.insert(lk.clone(), Value::F64(0.));
                    final_.insert(lk.clone(), Value::F64(begin_level));
                } else if !begin_on && final_on {
                    // turning on: pre-seed the hardware at zero to
                    // avoid a flash at the old level
                    let target = end
                        .get(&lk)
                        .or_else(|| final_.get(&lk))
                        .and_then(|v| v.cast_f64().ok())
                        .unwrap_or(if begin_level > 0. { begin_level } else { 1. });
                    let mut seed = PropertyBatch::new();
                    seed.insert(lk.clone(), Value::F64(0.));
                    seed.insert(ArcStr::from(KEY_ONOFF), Value::Bool(true));
                    if let Err(e) = self.apply_now(seed) {
                        first_err.get_or_insert(e);
                    }
                    begin.insert(lk.clone(), Value::F64(0.));
                    begin.insert(ArcStr::from(KEY_ONOFF), Value::Bool(true));
                    end.insert(lk.clone(), Value::F64(target));
                    end.insert(ArcStr::from(KEY_ONOFF), Value::Bool(true));
                    final_.insert(lk.clone(), Value::F64(target));
                    final_.insert(ArcStr::from(KEY_ONOFF), Value::Bool(true));
                }
            }
        }
        let total = Duration::try_from_secs_f64(duration).unwrap_or(Duration::ZERO);
        let t_begin = Instant::now();
        let t_end = t_begin + total;
        let period = tick_period(total);
        let weak = self.me.clone();
        let tick = self.exec.schedule_fixed_rate(
            period,
            period,
            Box::new(move || {
                if let Some(t) = weak.upgrade() {
                    t.transition_tick()
                }
            }),
        );
        {
            let mut st = self.state.lock();
            st.transition = Some(Transition {
                begin,
                end,
                final_,
                t_begin,
                t_end,
                tick: Some(tick),
                explicit,
            });
        }
        first_err.map_or(Ok(()), Err)
    }

    /// One tick: write interpolated intermediates, or complete.
    pub(crate) fn transition_tick(&self) {
        let _serial = self.op_lock.lock();
        let (batch, finals) = {
            let mut st = self.state.lock();
            let p = match st.transition.as_ref() {
                None => return,
                Some(tr) => {
                    let total = tr.t_end.saturating_duration_since(tr.t_begin);
                    if total.is_zero() {
                        1.
                    } else {
                        (Instant::now()
                            .saturating_duration_since(tr.t_begin)
                            .as_secs_f64()
                            / total.as_secs_f64())
                        .clamp(0., 1.)
                    }
                }
            };
            if p >= 1. {
                let tr = st.transition.take().expect("checked above");
                (None, Some(tr.final_))
            } else {
                let tr = st.transition.as_ref().expect("checked above");
                let mut batch = PropertyBatch::new();
                for (name, ev) in tr.end.iter() {
                    let bv = tr.begin.get(name).cloned().unwrap_or(Value::Null);
                    if let Some(iv) = interpolate(&bv, ev, p) {
                        batch.insert(name.clone(), iv);
                    }
                }
                (Some(batch), None)
            }
        };
        if let Some(batch) = batch {
            if let Err(e) = self.apply_now(batch) {
                log::warn!("{}: transition tick failed: {e}", self.uid())
            }
        }
        if let Some(finals) = finals {
            self.finish_transition(finals)
        }
    }

    fn finish_transition(&self, finals: IndexMap<ArcStr, Value>) {
        let batch: PropertyBatch = finals.into_iter().collect();
        if let Err(e) = self.apply_now(batch) {
            log::warn!("{}: transition completion failed: {e}", self.uid())
        }
        if self.defs.contains_key(KEY_TRAN_D) {
            let mut b = PropertyBatch::new();
            b.insert(ArcStr::from(KEY_TRAN_D), Value::F64(0.));
            let _ = self.apply_now(b);
        }
        self.announce_persist_changed();
    }

    pub fn transition_in_progress(&self) -> bool {
        self.state.lock().transition.is_some()
    }

    /// Cancel the tick but keep the timestamps, so a later resume
    /// picks up where the clock actually is.
    pub fn pause_transition(&self) {
        let _serial = self.op_lock.lock();
        if let Some(tr) = self.state.lock().transition.as_mut() {
            tr.tick = None;
        }
    }

    /// Restart the tick with a period recomputed from the remaining
    /// interval.
    pub fn resume_transition(&self) {
        let _serial = self.op_lock.lock();
        let mut st = self.state.lock();
        if let Some(tr) = st.transition.as_mut() {
            if tr.tick.is_none() {
                let remaining = tr.t_end.saturating_duration_since(Instant::now());
                let period = tick_period(remaining);
                let weak = self.me.clone();
                tr.tick = Some(self.exec.schedule_fixed_rate(
                    period,
                    period,
                    Box::new(move || {
                        if let Some(t) = weak.upgrade() {
                            t.transition_tick()
                        }
                    }),
                ));
            }
        }
    }

    /// Drop the transition entirely: begin/end/final and timestamps
    /// are cleared, already applied intermediates stay.
    pub fn stop_transition(&self) {
        let _serial = self.op_lock.lock();
        self.state.lock().transition = None;
    }
}

/// The transition trait: duration and speed readouts plus the
/// configured default duration.
#[derive(Debug)]
pub struct TransitionTrait {
    store: StoredTrait,
}

impl TransitionTrait {
    pub fn new() -> Self {
        TransitionTrait {
            store: StoredTrait::with_values(
                propdefs![
                    (State, "tran", "d", Real, Get | Set | NoSave | NoTrans),
                    (State, "tran", "sp", Real, Get | Set | NoSave | NoTrans),
                    (Config, "tran", "ddur", Real, Get | Set),
                ],
                [(ArcStr::from(KEY_TRAN_D), Value::F64(0.))],
            ),
        }
    }
}

impl Default for TransitionTrait {
    fn default() -> Self {
        Self::new()
    }
}

impl ThingTrait for TransitionTrait {
    fn name(&self) -> &'static str {
        "Transition"
    }

    fn short_id(&self) -> &'static str {
        "tran"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:transition"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
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
}
