//! Query documents and the table-driven builder that produces them.
//!
//! Every broker dataset takes the same document shape; only the field names
//! and their kinds differ. A [`QueryTemplate`] lists those fields once and
//! [`QueryTemplate::build`] maps typed [`Selection`]s onto the document.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::WekeoError;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDocument {
    pub dataset_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding_box_values: Vec<BoundingBoxValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date_range_select_values: Vec<DateRangeValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multi_string_select_values: Vec<MultiStringValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_choice_values: Vec<StringChoiceValue>,
}

impl QueryDocument {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            bounding_box_values: Vec::new(),
            date_range_select_values: Vec::new(),
            multi_string_select_values: Vec::new(),
            string_choice_values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxValue {
    pub name: String,
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRangeValue {
    pub name: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStringValue {
    pub name: String,
    pub value: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringChoiceValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// A value captured from the user for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    Choice(String),
    Multi(Vec<String>),
    Area(BoundingBox),
    Dates(DateRange),
}

pub type Selections = BTreeMap<String, Selection>;

/// Corner order the dataset expects inside `bbox`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BboxOrder {
    WestNorthEastSouth,
    WestSouthEastNorth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    StringChoice,
    MultiSelect,
    BoundingBox { order: BboxOrder },
    DateRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Key under which the selection is captured.
    pub key: String,
    /// Field name in the broker document.
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub fixed: Option<Selection>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            key: name.to_string(),
            name: name.to_string(),
            kind,
            fixed: None,
            required: true,
        }
    }

    pub fn keyed(key: &str, name: &str, kind: FieldKind) -> Self {
        Self {
            key: key.to_string(),
            ..Self::new(name, kind)
        }
    }

    pub fn fixed(name: &str, kind: FieldKind, value: Selection) -> Self {
        Self {
            fixed: Some(value),
            ..Self::new(name, kind)
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub dataset_id: String,
    pub fields: Vec<FieldSpec>,
}

pub const PRESET_NAMES: &[&str] = &[
    "era5-single-levels",
    "cams-europe-forecast",
    "efas-historical",
    "sea-bottom-temperature",
    "corine",
];

impl QueryTemplate {
    pub fn new(dataset_id: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            fields,
        }
    }

    pub fn with_dataset_id(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = dataset_id.into();
        self
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "era5-single-levels" => Some(Self::era5_single_levels()),
            "cams-europe-forecast" => Some(Self::cams_europe_forecast()),
            "efas-historical" => Some(Self::efas_historical()),
            "sea-bottom-temperature" => Some(Self::sea_bottom_temperature()),
            "corine" => Some(Self::corine()),
            _ => None,
        }
    }

    pub fn era5_single_levels() -> Self {
        Self::new(
            "EO:ECMWF:DAT:REANALYSIS_ERA5_SINGLE_LEVELS",
            vec![
                FieldSpec::new("variable", FieldKind::MultiSelect),
                FieldSpec::new("year", FieldKind::MultiSelect),
                FieldSpec::new("month", FieldKind::MultiSelect),
                FieldSpec::new("day", FieldKind::MultiSelect),
                FieldSpec::new("time", FieldKind::MultiSelect),
                FieldSpec::new("product_type", FieldKind::MultiSelect),
                FieldSpec::new("format", FieldKind::StringChoice),
            ],
        )
    }

    pub fn cams_europe_forecast() -> Self {
        Self::new(
            "EO:ECMWF:DAT:CAMS_EUROPE_AIR_QUALITY_FORECASTS",
            vec![
                FieldSpec::new(
                    "area",
                    FieldKind::BoundingBox {
                        order: BboxOrder::WestNorthEastSouth,
                    },
                ),
                FieldSpec::new("date", FieldKind::DateRange),
                FieldSpec::new("variable", FieldKind::MultiSelect),
                FieldSpec::new("model", FieldKind::MultiSelect),
                FieldSpec::new("level", FieldKind::MultiSelect),
                FieldSpec::new("type", FieldKind::MultiSelect),
                FieldSpec::new("time", FieldKind::MultiSelect),
                FieldSpec::new("leadtime_hour", FieldKind::MultiSelect),
                FieldSpec::new("format", FieldKind::StringChoice),
            ],
        )
    }

    pub fn efas_historical() -> Self {
        Self::new(
            "EO:ECMWF:DAT:EFAS_HISTORICAL",
            vec![
                FieldSpec::new("variable", FieldKind::MultiSelect),
                FieldSpec::new("soil_level", FieldKind::MultiSelect),
                FieldSpec::keyed("year", "hyear", FieldKind::MultiSelect),
                FieldSpec::keyed("month", "hmonth", FieldKind::MultiSelect),
                FieldSpec::keyed("day", "hday", FieldKind::MultiSelect),
                FieldSpec::new("time", FieldKind::MultiSelect),
                FieldSpec::new("system_version", FieldKind::StringChoice),
                FieldSpec::new("format", FieldKind::StringChoice),
                FieldSpec::new("model_levels", FieldKind::StringChoice),
            ],
        )
    }

    pub fn sea_bottom_temperature() -> Self {
        Self::new(
            "EO:MO:DAT:NWSHELF_ANALYSISFORECAST_PHY_LR_004_001",
            vec![
                FieldSpec::new(
                    "bbox",
                    FieldKind::BoundingBox {
                        order: BboxOrder::WestSouthEastNorth,
                    },
                ),
                FieldSpec::keyed("date", "position", FieldKind::DateRange),
                FieldSpec::fixed(
                    "variable",
                    FieldKind::MultiSelect,
                    Selection::Multi(vec!["bottomT".to_string()]),
                ),
                FieldSpec::fixed(
                    "service",
                    FieldKind::StringChoice,
                    Selection::Choice("NWSHELF_ANALYSISFORECAST_PHY_LR_004_001-TDS".to_string()),
                ),
                FieldSpec::fixed(
                    "product",
                    FieldKind::StringChoice,
                    Selection::Choice("cmems_mod_nws_phy-bottomt_anfc_7km-2D_P1D-m".to_string()),
                ),
            ],
        )
    }

    pub fn corine() -> Self {
        Self::new(
            "EO:EEA:DAT:CORINE",
            vec![
                FieldSpec::new("product_type", FieldKind::StringChoice),
                FieldSpec::new("format", FieldKind::StringChoice),
            ],
        )
    }

    pub fn build(&self, selections: &Selections) -> Result<QueryDocument, WekeoError> {
        if self.dataset_id.trim().is_empty() {
            return Err(WekeoError::InvalidQuery("dataset id is empty".to_string()));
        }
        for key in selections.keys() {
            let known = self
                .fields
                .iter()
                .any(|field| field.fixed.is_none() && &field.key == key);
            if !known {
                return Err(WekeoError::InvalidQuery(format!(
                    "unknown field {key:?} for {}",
                    self.dataset_id
                )));
            }
        }

        let mut document = QueryDocument::new(self.dataset_id.clone());
        for field in &self.fields {
            let selection = match field.fixed.as_ref().or_else(|| selections.get(&field.key)) {
                Some(selection) => selection,
                None if field.required => {
                    return Err(WekeoError::InvalidQuery(format!(
                        "missing selection for {:?}",
                        field.key
                    )));
                }
                None => continue,
            };
            apply_field(&mut document, field, selection)?;
        }
        Ok(document)
    }
}

fn apply_field(
    document: &mut QueryDocument,
    field: &FieldSpec,
    selection: &Selection,
) -> Result<(), WekeoError> {
    let name = field.name.clone();
    match (field.kind, selection) {
        (FieldKind::StringChoice, Selection::Choice(value)) => {
            document.string_choice_values.push(StringChoiceValue {
                name,
                value: value.clone(),
            });
        }
        (FieldKind::MultiSelect, Selection::Multi(values)) => {
            document.multi_string_select_values.push(MultiStringValue {
                name,
                value: values.clone(),
            });
        }
        // A single value is accepted where a list is expected.
        (FieldKind::MultiSelect, Selection::Choice(value)) => {
            document.multi_string_select_values.push(MultiStringValue {
                name,
                value: vec![value.clone()],
            });
        }
        (FieldKind::BoundingBox { order }, Selection::Area(area)) => {
            let bbox = match order {
                BboxOrder::WestNorthEastSouth => [area.west, area.north, area.east, area.south],
                BboxOrder::WestSouthEastNorth => [area.west, area.south, area.east, area.north],
            };
            document
                .bounding_box_values
                .push(BoundingBoxValue { name, bbox });
        }
        (FieldKind::DateRange, Selection::Dates(range)) => {
            if range.end < range.start {
                return Err(WekeoError::InvalidQuery(format!(
                    "date range for {:?} ends before it starts",
                    field.key
                )));
            }
            document.date_range_select_values.push(DateRangeValue {
                name,
                start: format_date(range.start),
                end: format_date(range.end),
            });
        }
        (kind, _) => {
            return Err(WekeoError::InvalidQuery(format!(
                "selection for {:?} does not match field kind {kind:?}",
                field.key
            )));
        }
    }
    Ok(())
}

pub fn format_date(date: NaiveDate) -> String {
    date.and_time(NaiveTime::MIN).format(DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_format_matches_broker() {
        let date = NaiveDate::from_ymd_opt(2022, 3, 7).unwrap();
        assert_eq!(format_date(date), "2022-03-07T00:00:00.000Z");
    }

    #[test]
    fn every_preset_resolves() {
        for name in PRESET_NAMES {
            assert!(QueryTemplate::preset(name).is_some(), "{name}");
        }
        assert!(QueryTemplate::preset("nope").is_none());
    }
}
