//! The Light trait: color temperature in mireds.
use crate::{
    dispatch::{PropertyDef, StoredTrait, ThingTrait, TraitCallback},
    error::{Error, Result},
    key::PropertyKey,
};
use crate::propdefs;
use splot_value::Value;

/// The gamut most white-spectrum hardware can actually reach.
const MIRE_MIN: f64 = 100.;
const MIRE_MAX: f64 = 500.;

#[derive(Debug)]
pub struct LightTrait {
    store: StoredTrait,
}

impl LightTrait {
    pub fn new() -> Self {
        LightTrait {
            store: StoredTrait::new(propdefs![
                (State, "lght", "mire", Real, Get | Set | Change),
            ]),
        }
    }
}

impl Default for LightTrait {
    fn default() -> Self {
        Self::new()
    }
}

impl ThingTrait for LightTrait {
    fn name(&self) -> &'static str {
        "Light"
    }

    fn short_id(&self) -> &'static str {
        "lght"
    }

    fn uri(&self) -> &'static str {
        "tag:splot,2026:trait:light"
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
            .cast_f64()
            .map_err(|_| Error::InvalidPropertyValue(key.name().clone()))?;
        Ok(Value::F64(v.clamp(MIRE_MIN, MIRE_MAX)))
    }

    fn get(&self, key: &PropertyKey) -> Result<Value> {
        self.store.raw_get(key)
    }

    fn set(&self, key: &PropertyKey, value: Value) -> Result<()> {
        self.store.raw_set(key, value)
    }
}
