//! The OnOff trait: a single boolean power state.
use crate::{
    dispatch::{PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::Result,
    key::PropertyKey,
};
use crate::propdefs;
use splot_value::Value;

#[derive(Debug)]
pub struct OnOffTrait {
    store: StoredTrait,
}

impl OnOffTrait {
    pub fn new() -> Self {
        OnOffTrait {
            store: StoredTrait::with_values(
                propdefs![(State, "onof", "v", Bool, Get | Set | Req | Change)],
                [(arcstr::literal!("s/onof/v"), Value::Bool(false))],
            ),
        }
    }
}

impl Default for OnOffTrait {
    fn default() -> Self {
        Self::new()
    }
}

impl ThingTrait for OnOffTrait {
    fn name(&self) -> &'static str {
        "OnOff"
    }

    fn short_id(&self) -> &'static str {
        "onof"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:onoff"
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
