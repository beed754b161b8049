//! In-process stencil store backing the `id://` locator scheme. Holds
//! serialized markup, not live trees; loading always yields a fresh
//! read-only copy, so an included stencil never aliases the including
//! document.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use lazy_static::lazy_static;

use crate::error::StencilError;
use crate::stencil::Stencil;

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

pub fn register(id: &str, markup: &str) {
    REGISTRY
        .lock()
        .expect("registry lock never poisoned")
        .insert(id.to_string(), markup.to_string());
}

pub fn unregister(id: &str) {
    REGISTRY
        .lock()
        .expect("registry lock never poisoned")
        .remove(id);
}

pub fn load(id: &str) -> Result<Stencil> {
    let markup = {
        let m = REGISTRY.lock().expect("registry lock never poisoned");
        m.get(id)
            .ok_or_else(|| StencilError::UnknownId(id.to_string()))?
            .clone()
    };
    Ok(Stencil::from_markup(&markup)?)
}
