//! The Level trait: a percent valued output level. Sanitization
//! clamps into the unit interval.
use crate::{
    dispatch::{PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::{Error, Result},
    key::PropertyKey,
};
use crate::propdefs;
use splot_value::Value;

#[derive(Debug)]
pub struct LevelTrait {
    store: StoredTrait,
}

impl LevelTrait {
    pub fn new() -> Self {
        LevelTrait {
            store: StoredTrait::with_values(
                propdefs![(State, "levl", "v", Real, Get | Set | Req | Change)],
                [(arcstr::literal!("s/levl/v"), Value::F64(0.))],
            ),
        }
    }
}

impl Default for LevelTrait {
    fn default() -> Self {
        Self::new()
    }
}

impl ThingTrait for LevelTrait {
    fn name(&self) -> &'static str {
        "Level"
    }

    fn short_id(&self) -> &'static str {
        "levl"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:level"
    }

    fn properties(&self) -> &[PropertyDef] {
        self.store.defs()
    }

    fn bind(&self, cb: TraitCallback) {
        self.store.bind(cb)
    }

    fn sanitize(&self, key: &PropertyKey, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(value);
        }
        let v = value
            .cast_percent()
            .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
        Ok(Value::F64(v))
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.raw_get(key)
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        self.store.raw_set(key, value)
    }
}
