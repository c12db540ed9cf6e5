//! Extraction of the administrative hierarchy nested inside IBGE records.
//!
//! A municipality record carries two ancestry trees:
//! `microrregiao → mesorregiao → UF → regiao` and
//! `regiao-imediata → regiao-intermediaria`. Each record yields a
//! [`HierarchyFragment`]; a [`HierarchyBatch`] merges fragments so every level
//! is deduplicated before anything is written.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::domain::{
    ImmediateRegion, IntermediateRegion, Mesoregion, Microregion, Municipality, Region, State,
};
use crate::error::ImportError;

/// A record that passed the id/name check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRecord {
    pub id: i64,
    pub name: String,
}

/// Requires a non-zero id and a non-blank name; the name is trimmed.
pub fn validate_record(raw: &Value, kind: &str) -> Result<ValidRecord, ImportError> {
    let id = raw
        .get("id")
        .and_then(json_id)
        .ok_or_else(|| ImportError::Validation(format!("{kind} without id")))?;
    let name = raw
        .get("nome")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ImportError::Validation(format!("{kind} {id} without name")))?;
    Ok(ValidRecord {
        id,
        name: name.to_string(),
    })
}

/// Accepts numeric ids and digit strings; zero counts as absent.
pub fn json_id(value: &Value) -> Option<i64> {
    let id = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (id != 0).then_some(id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyFragment {
    pub region: Option<Region>,
    pub state: Option<State>,
    pub mesoregion: Option<Mesoregion>,
    pub microregion: Option<Microregion>,
    pub intermediate_region: Option<IntermediateRegion>,
    pub immediate_region: Option<ImmediateRegion>,
}

impl HierarchyFragment {
    pub fn municipality(&self, record: &ValidRecord) -> Municipality {
        Municipality {
            id: record.id,
            name: record.name.clone(),
            microregion_id: self.microregion.as_ref().map(|micro| micro.id),
            immediate_region_id: self.immediate_region.as_ref().map(|imm| imm.id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_none()
            && self.state.is_none()
            && self.mesoregion.is_none()
            && self.microregion.is_none()
            && self.intermediate_region.is_none()
            && self.immediate_region.is_none()
    }
}

/// Reads the hierarchy of one municipality record. Never fails: levels that
/// cannot be resolved stay `None` and a warning is logged.
pub fn extract_hierarchy(raw: &Value) -> HierarchyFragment {
    let mut fragment = HierarchyFragment::default();
    let record_id = raw.get("id").and_then(json_id).unwrap_or_default();

    let micro = object(raw, "microrregiao");
    let meso = micro.and_then(|micro| object(micro, "mesorregiao"));
    let uf = meso.and_then(|meso| object(meso, "UF"));
    let regiao = uf.and_then(|uf| object(uf, "regiao"));

    let (Some(micro), Some(meso), Some(uf), Some(regiao)) = (micro, meso, uf, regiao) else {
        warn!(municipality = record_id, "incomplete microrregiao nesting, hierarchy left empty");
        return fragment;
    };

    // Each level is only resolved once its parent is.
    let Some(region) = coded(regiao).map(|(id, short_code, name)| Region {
        id,
        short_code,
        name,
    }) else {
        warn!(municipality = record_id, "malformed regiao");
        return fragment;
    };
    let region_id = region.id;
    fragment.region = Some(region);

    let Some(state) = coded(uf).map(|(id, short_code, name)| State {
        id,
        short_code,
        name,
        region_id,
    }) else {
        warn!(municipality = record_id, "malformed UF");
        return fragment;
    };
    let state_id = state.id;
    fragment.state = Some(state);

    match named(meso) {
        Some((id, name)) => {
            fragment.mesoregion = Some(Mesoregion { id, name, state_id });
            match named(micro) {
                Some((micro_id, micro_name)) => {
                    fragment.microregion = Some(Microregion {
                        id: micro_id,
                        name: micro_name,
                        mesoregion_id: id,
                    });
                }
                None => warn!(municipality = record_id, "malformed microrregiao"),
            }
        }
        None => warn!(municipality = record_id, "malformed mesorregiao"),
    }

    if let Some(immediate) = object(raw, "regiao-imediata") {
        let intermediate = object(immediate, "regiao-intermediaria").and_then(named);
        match (named(immediate), intermediate) {
            (Some((immediate_id, immediate_name)), Some((intermediate_id, intermediate_name))) => {
                fragment.intermediate_region = Some(IntermediateRegion {
                    id: intermediate_id,
                    name: intermediate_name,
                    state_id,
                });
                fragment.immediate_region = Some(ImmediateRegion {
                    id: immediate_id,
                    name: immediate_name,
                    intermediate_region_id: intermediate_id,
                });
            }
            _ => warn!(
                municipality = record_id,
                "regiao-imediata without a resolvable regiao-intermediaria"
            ),
        }
    }

    fragment
}

/// Reads the `{id, sigla, nome, regiao}` shape returned by the states endpoint.
pub fn extract_state(raw: &Value) -> Result<(Region, State), ImportError> {
    let (region_id, region_code, region_name) = object(raw, "regiao")
        .and_then(coded)
        .ok_or_else(|| ImportError::Validation("estado without a valid regiao".to_string()))?;
    let (id, short_code, name) = coded(raw)
        .ok_or_else(|| ImportError::Validation("estado without id, sigla or nome".to_string()))?;
    Ok((
        Region {
            id: region_id,
            short_code: region_code,
            name: region_name,
        },
        State {
            id,
            short_code,
            name,
            region_id,
        },
    ))
}

fn object<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).filter(|nested| nested.is_object())
}

fn named(value: &Value) -> Option<(i64, String)> {
    let id = value.get("id").and_then(json_id)?;
    let name = value.get("nome")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    Some((id, name.to_string()))
}

fn coded(value: &Value) -> Option<(i64, String, String)> {
    let (id, name) = named(value)?;
    let code = value.get("sigla")?.as_str()?.trim().to_string();
    Some((id, code, name))
}

/// The six levels of a batch, deduplicated by id. The first record seen for
/// an id wins; later duplicates are dropped.
#[derive(Debug, Clone, Default)]
pub struct HierarchyBatch {
    pub regions: BTreeMap<i64, Region>,
    pub states: BTreeMap<i64, State>,
    pub intermediate_regions: BTreeMap<i64, IntermediateRegion>,
    pub immediate_regions: BTreeMap<i64, ImmediateRegion>,
    pub mesoregions: BTreeMap<i64, Mesoregion>,
    pub microregions: BTreeMap<i64, Microregion>,
}

impl HierarchyBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, fragment: &HierarchyFragment) {
        if let Some(region) = &fragment.region {
            self.regions.entry(region.id).or_insert_with(|| region.clone());
        }
        if let Some(state) = &fragment.state {
            self.states.entry(state.id).or_insert_with(|| state.clone());
        }
        if let Some(intermediate) = &fragment.intermediate_region {
            self.intermediate_regions
                .entry(intermediate.id)
                .or_insert_with(|| intermediate.clone());
        }
        if let Some(immediate) = &fragment.immediate_region {
            self.immediate_regions
                .entry(immediate.id)
                .or_insert_with(|| immediate.clone());
        }
        if let Some(meso) = &fragment.mesoregion {
            self.mesoregions.entry(meso.id).or_insert_with(|| meso.clone());
        }
        if let Some(micro) = &fragment.microregion {
            self.microregions.entry(micro.id).or_insert_with(|| micro.clone());
        }
    }

    pub fn from_fragments<'a, I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = &'a HierarchyFragment>,
    {
        let mut batch = Self::new();
        for fragment in fragments {
            batch.absorb(fragment);
        }
        batch
    }
}
