//! Canonical business record, opening hours and the non-clobbering merge.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "venrich-core";

/// `(open, close)` as zero-padded 24h `"HH:MM"` strings.
pub type DayHours = (String, String);

/// Weekly schedule indexed 0=Sunday..6=Saturday; `None` means closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    pub weekly: [Option<DayHours>; 7],
}

impl OpeningHours {
    pub fn uniform(open: &str, close: &str) -> Self {
        Self {
            weekly: std::array::from_fn(|_| Some((open.to_string(), close.to_string()))),
        }
    }

    /// Entry for a weekday, counted from Sunday.
    pub fn day(&self, days_from_sunday: usize) -> Option<&DayHours> {
        self.weekly.get(days_from_sunday).and_then(Option::as_ref)
    }

    /// Inclusive on both ends. Plain string comparison is sound because both
    /// sides share the fixed-width `HH:MM` format.
    pub fn is_open_at<T: Datelike + Timelike>(&self, at: &T) -> bool {
        let index = at.weekday().num_days_from_sunday() as usize;
        let Some((open, close)) = self.day(index) else {
            return false;
        };
        let now = format!("{:02}:{:02}", at.hour(), at.minute());
        open.as_str() <= now.as_str() && now.as_str() <= close.as_str()
    }
}

/// Which upstream list/row contributed to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTag {
    pub list_name: String,
    pub row: u32,
}

impl SourceTag {
    pub fn new(list_name: impl Into<String>, row: u32) -> Self {
        Self {
            list_name: list_name.into(),
            row,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Field name (or `extras.<key>`) to the id of the provider that filled it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provenance: BTreeMap<String, String>,
}

impl Meta {
    fn is_empty(&self) -> bool {
        self.provenance.is_empty()
    }
}

/// The canonical enriched record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessData {
    pub name: String,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub town: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub opening_hours: Option<OpeningHours>,
    #[serde(default)]
    pub sources: Vec<SourceTag>,
    #[serde(default)]
    pub extras: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

impl BusinessData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_postcode(mut self, postcode: impl Into<String>) -> Self {
        self.postcode = Some(postcode.into());
        self
    }

    /// Closed whenever no schedule is known.
    pub fn is_open_at<T: Datelike + Timelike>(&self, at: &T) -> bool {
        self.opening_hours
            .as_ref()
            .is_some_and(|hours| hours.is_open_at(at))
    }

    pub fn extra_is_absent(&self, key: &str) -> bool {
        self.extras.get(key).map_or(true, JsonValue::is_null)
    }

    /// Inserts only when the key is missing or null. Returns whether it wrote.
    pub fn set_extra_if_absent(&mut self, key: &str, value: JsonValue) -> bool {
        if value.is_null() || !self.extra_is_absent(key) {
            return false;
        }
        self.extras.insert(key.to_string(), value);
        true
    }
}

pub fn text_is_present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// Sets `target` from `candidate` only when `target` is missing or empty.
pub fn fill_text_if_empty(target: &mut Option<String>, candidate: Option<String>) -> bool {
    if text_is_present(target) || !text_is_present(&candidate) {
        return false;
    }
    *target = candidate;
    true
}

/// Non-clobbering merge of `incoming` into `current`.
///
/// Existing non-empty values always win. `sources` are unioned by
/// `(listName, row)` keeping first-seen order, `extras` and provenance are
/// unioned with `current`'s keys taking precedence. Returns the names of the
/// fields that were filled, with extras reported as `extras.<key>`.
pub fn merge_into(current: &mut BusinessData, incoming: BusinessData) -> Vec<String> {
    let mut filled = Vec::new();

    if current.name.is_empty() && !incoming.name.is_empty() {
        current.name = incoming.name;
        filled.push("name".to_string());
    }

    let text_fields = [
        ("postcode", &mut current.postcode, incoming.postcode),
        ("address", &mut current.address, incoming.address),
        ("town", &mut current.town, incoming.town),
        ("phone", &mut current.phone, incoming.phone),
        ("email", &mut current.email, incoming.email),
        ("notes", &mut current.notes, incoming.notes),
    ];
    for (field, target, candidate) in text_fields {
        if fill_text_if_empty(target, candidate) {
            filled.push(field.to_string());
        }
    }

    if current.opening_hours.is_none() && incoming.opening_hours.is_some() {
        current.opening_hours = incoming.opening_hours;
        filled.push("openingHours".to_string());
    }

    current.sources = union_sources(std::mem::take(&mut current.sources), incoming.sources);

    for (key, value) in incoming.extras {
        if current.set_extra_if_absent(&key, value) {
            filled.push(format!("extras.{key}"));
        }
    }

    for (field, provider) in incoming.meta.provenance {
        current.meta.provenance.entry(field).or_insert(provider);
    }

    filled
}

/// Pure form of [`merge_into`].
pub fn merge(current: &BusinessData, incoming: &BusinessData) -> BusinessData {
    let mut out = current.clone();
    merge_into(&mut out, incoming.clone());
    out
}

fn union_sources(first: Vec<SourceTag>, second: Vec<SourceTag>) -> Vec<SourceTag> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(first.len() + second.len());
    for tag in first.into_iter().chain(second) {
        if seen.insert((tag.list_name.clone(), tag.row)) {
            out.push(tag);
        }
    }
    out
}
