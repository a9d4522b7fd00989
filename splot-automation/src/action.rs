//! Action lists shared by timers and rules.
//!
//! An action is a (path, method, body) triple; only POST is
//! recognized, and that is enforced when the list is assigned, not
//! when it fires. Invocation failures are logged and reported
//! through the owner's trap leaf; sibling actions still run.
use arcstr::ArcStr;
use compact_str::format_compact;
use indexmap::IndexMap;
use parking_lot::Mutex;
use splot_core::{
    dispatch::{PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    Error, Exec, PropertyKey, Result, WeakHost,
};
use splot_value::Value;

/// Receives the trap outcome of a dispatch run.
pub type TrapSink = std::sync::Arc<dyn Fn(Option<ArcStr>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Action {
    pub path: ArcStr,
    pub body: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ActionList(pub Vec<Action>);

impl ActionList {
    /// Parse the stored form: an array of maps with keys `p` (path),
    /// `m` (method, defaults to POST), and `b` (body). Any method
    /// other than POST rejects here, at assignment time.
    pub fn parse(v: &Value) -> Result<ActionList> {
        let bad = || Error::InvalidPropertyValue(arcstr::literal!("c/acti/v"));
        let arr = match v {
            Value::Null => return Ok(ActionList::default()),
            Value::Array(a) => a.clone(),
            _ => return Err(bad()),
        };
        let mut out = Vec::with_capacity(arr.len());
        for e in arr.iter() {
            let m = e.cast_map().map_err(|_| bad())?;
            let path = m.get("p").and_then(|p| p.cast_uri().ok()).ok_or_else(bad)?;
            let method = m
                .get("m")
                .and_then(|v| v.cast_str().ok())
                .unwrap_or(arcstr::literal!("POST"));
            if !method.eq_ignore_ascii_case("POST") {
                return Err(bad());
            }
            let body = m.get("b").cloned().unwrap_or(Value::Null);
            out.push(Action { path, body });
        }
        Ok(ActionList(out))
    }

    pub fn to_value(&self) -> Value {
        if self.0.is_empty() {
            return Value::Null;
        }
        let items: Vec<Value> = self
            .0
            .iter()
            .map(|a| {
                let mut m = IndexMap::new();
                m.insert(arcstr::literal!("p"), Value::Uri(a.path.clone()));
                m.insert(arcstr::literal!("m"), Value::from("POST"));
                if !a.body.is_null() {
                    m.insert(arcstr::literal!("b"), a.body.clone());
                }
                m.into()
            })
            .collect();
        items.into()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fire every action in order on the executor. The trap sink
    /// receives `Some("<index>:<token>")` for the first failure of
    /// the run, or `None` when the whole run succeeded.
    pub fn dispatch(&self, host: WeakHost, exec: &Exec, trap: TrapSink) {
        let actions = self.0.clone();
        exec.spawn_boxed(Box::pin(async move {
            let host = match host.upgrade() {
                None => return,
                Some(h) => h,
            };
            let mut first_fail: Option<ArcStr> = None;
            for (i, a) in actions.iter().enumerate() {
                let r = match host.link(&a.path) {
                    Err(e) => Err(e),
                    Ok(l) => l.invoke(a.body.clone()).await,
                };
                if let Err(e) = r {
                    log::warn!("action {i} ({}) failed: {e}", a.path);
                    if first_fail.is_none() {
                        first_fail = Some(ArcStr::from(
                            format_compact!("{i}:{}", e.token()).as_str(),
                        ));
                    }
                }
            }
            trap(first_fail)
        }));
    }
}

/// The actions trait: `c/acti/v` holds the action list. Shared by
/// timers and rules; the legacy snapshot key `c/timr/acti` remaps
/// here on restore.
#[derive(Debug)]
pub struct ActionsTrait {
    store: StoredTrait,
    parsed: Mutex<ActionList>,
}

impl ActionsTrait {
    pub fn new() -> Self {
        ActionsTrait {
            store: StoredTrait::new(propdefs_acti()),
            parsed: Mutex::new(ActionList::default()),
        }
    }

    pub fn actions(&self) -> ActionList {
        self.parsed.lock().clone()
    }
}

fn propdefs_acti() -> Vec<PropertyDef> {
    splot_core::propdefs![(Config, "acti", "v", Array, Get | Set)]
}

impl Default for ActionsTrait {
    fn default() -> Self {
        Self::new()
    }
}

impl ThingTrait for ActionsTrait {
    fn name(&self) -> &'static str {
        "Actions"
    }

    fn short_id(&self) -> &'static str {
        "acti"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:actions"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn sanitize(&self, _key: &PropertyKey, value: Value) -> Result<Value> {
        // validated structurally at set; arrays of maps pass through
        Ok(value)
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.def(key)?;
        Ok(self.parsed.lock().to_value())
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        self.store.def(key)?;
        let list = ActionList::parse(&value)?;
        *self.parsed.lock() = list;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn action_value(path: &str) -> Value {
        let mut m = IndexMap::new();
        m.insert(ArcStr::from("p"), Value::from(path));
        m.insert(ArcStr::from("m"), Value::from("POST"));
        let v: Value = m.into();
        vec![v].into()
    }

    #[test]
    fn parse_round_trip() {
        let v = action_value("/1/s/onof/v?tog");
        let l = ActionList::parse(&v).unwrap();
        assert_eq!(l.0.len(), 1);
        assert_eq!(l.0[0].path.as_str(), "/1/s/onof/v?tog");
        let l2 = ActionList::parse(&l.to_value()).unwrap();
        assert_eq!(l2.0[0].path, l.0[0].path);
    }

    #[test]
    fn non_post_rejects_at_assignment() {
        let mut m = IndexMap::new();
        m.insert(ArcStr::from("p"), Value::from("/1/s/onof/v"));
        m.insert(ArcStr::from("m"), Value::from("GET"));
        let v: Value = vec![Value::from(m)].into();
        assert!(matches!(
            ActionList::parse(&v),
            Err(Error::InvalidPropertyValue(_))
        ));
    }

    #[test]
    fn null_is_empty() {
        assert!(ActionList::parse(&Value::Null).unwrap().is_empty());
    }
}
