//! The base trait every local thing carries: identity metadata and
//! the administratively assigned name.
use crate::{
    dispatch::{PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::Result,
    key::PropertyKey,
};
use crate::propdefs;
use arcstr::ArcStr;
use splot_value::Value;

#[derive(Debug)]
pub struct BaseTrait {
    store: StoredTrait,
}

impl BaseTrait {
    pub fn new(uid: ArcStr, name: Option<ArcStr>) -> Self {
        let mut init = vec![(arcstr::literal!("m/base/uid"), Value::String(uid))];
        if let Some(n) = name {
            init.push((arcstr::literal!("c/base/name"), Value::String(n)));
        }
        BaseTrait {
            store: StoredTrait::with_values(
                propdefs![
                    (Metadata, "base", "uid", String, Const | Req),
                    (Config, "base", "name", String, Get | Set),
                ],
                init,
            ),
        }
    }
}

impl ThingTrait for BaseTrait {
    fn name(&self) -> &'static str {
        "Base"
    }

    fn short_id(&self) -> &'static str {
        "base"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:base"
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
