//! Turns raw size-metadata payloads into display-ready records.
//!
//! The endpoint answers with a flat JSON object. Two of its fields, `SizeInfo` and `Avatar`,
//! are themselves JSON documents encoded as strings and need a second parse pass.
//! [`process_api_data`] performs that pass and derives the availability flags consumers use
//! to decide which sections to render.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::caching::FetchError;

/// The unit used when the payload does not specify one.
pub const DEFAULT_UNIT: &str = "cm";

/// The payload as returned by the size-metadata endpoint.
///
/// Every field is optional, unknown fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RawPayload {
    /// The size table, as a JSON-encoded string.
    #[serde(rename = "SizeInfo", default)]
    pub size_info: Option<Value>,
    /// Try-on reports, as a JSON-encoded string.
    #[serde(rename = "Avatar", default)]
    pub avatar: Option<Value>,
    #[serde(rename = "ChartInfo", default)]
    pub chart_info: Option<Value>,
    #[serde(rename = "AttributeInfo", default)]
    pub attribute_info: Option<Value>,
    /// Measurement unit of the size table.
    #[serde(rename = "punit", default)]
    pub unit: Option<String>,
    /// Free text shown below the size table.
    #[serde(rename = "Sizeinfo_textarea", default)]
    pub text_note: Option<String>,
}

/// The display-ready form of a [`RawPayload`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub garment_id: String,
    pub brand: String,
    /// The size table, usually a list of rows mapping column names to values.
    pub size_info: Option<Value>,
    /// Try-on reports of fitting models.
    pub avatar_info: Option<Value>,
    pub chart_info: Option<Value>,
    pub attribute_info: Option<Value>,
    pub unit: String,
    pub text_note: Option<String>,
    /// The identifier used by the diagram renderer, `M&{garment_id}&U`.
    pub gender_garment_id: String,
    pub has_avatar: bool,
    pub has_chart: bool,
    pub has_attributes: bool,
    pub has_text_note: bool,
}

impl NormalizedRecord {
    /// Returns the rows of the size table, if it is a list of objects.
    pub fn size_rows(&self) -> Option<Vec<&serde_json::Map<String, Value>>> {
        self.size_info.as_ref()?.as_array()?.iter().map(Value::as_object).collect()
    }
}

/// Normalizes a raw payload for the given garment.
///
/// Missing or empty fields become `None`. The only failure is a malformed embedded JSON
/// document in `SizeInfo` or `Avatar`.
pub fn process_api_data(
    raw: &RawPayload,
    garment_id: &str,
    brand: &str,
) -> Result<NormalizedRecord, FetchError> {
    let size_info = parse_embedded(raw.size_info.as_ref())?;
    let avatar_info = parse_embedded(raw.avatar.as_ref())?;
    let chart_info = raw.chart_info.clone().filter(is_truthy);
    let attribute_info = raw.attribute_info.clone().filter(is_truthy);
    let text_note = raw.text_note.clone().filter(|note| !note.is_empty());

    let unit = match raw.unit.as_deref() {
        Some(unit) if !unit.is_empty() => unit.to_owned(),
        _ => DEFAULT_UNIT.to_owned(),
    };

    Ok(NormalizedRecord {
        garment_id: garment_id.to_owned(),
        brand: brand.to_owned(),
        has_avatar: raw.avatar.as_ref().is_some_and(is_truthy) && !is_avatar_excluded(garment_id),
        has_chart: chart_info.is_some(),
        has_attributes: attribute_info.is_some(),
        has_text_note: text_note.is_some(),
        size_info,
        avatar_info,
        chart_info,
        attribute_info,
        unit,
        text_note,
        gender_garment_id: format!("M&{garment_id}&U"),
    })
}

/// Decodes a field that holds a JSON document encoded as a string.
///
/// Values that already are structured are taken as they are. An encoded `null` is absent.
fn parse_embedded(value: Option<&Value>) -> Result<Option<Value>, FetchError> {
    match value {
        Some(Value::String(encoded)) if !encoded.is_empty() => {
            let decoded: Value = serde_json::from_str(encoded)?;
            Ok((!decoded.is_null()).then_some(decoded))
        }
        Some(value) if is_truthy(value) && !value.is_string() => Ok(Some(value.clone())),
        _ => Ok(None),
    }
}

/// Whether the endpoint considers a field set.
///
/// `null`, `false`, `0` and the empty string all mean "not set".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether try-on reports must be hidden for this garment.
///
/// The category code is the first run of uppercase letters in the part of the id after the
/// first `_`. Codes containing an `A` are excluded. Ids without such a code are not.
///
/// This deliberately departs from the widget script, which fails the whole lookup for ids
/// whose `_` segment has no uppercase run. Such garments are served with try-on reports.
fn is_avatar_excluded(garment_id: &str) -> bool {
    let Some(segment) = garment_id.split('_').nth(1) else {
        return false;
    };
    let Some(start) = segment.find(|c: char| c.is_ascii_uppercase()) else {
        return false;
    };
    segment[start..]
        .chars()
        .take_while(|c| c.is_ascii_uppercase())
        .any(|c| c == 'A')
}
