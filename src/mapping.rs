//! Segment mapping documents.
//!
//! A mapping document describes the segments a label volume may contain, in
//! the JSON meta-information dialect used by dcmqi. Each entry of
//! `segmentAttributes` declares a `labelID` (the voxel value) together with
//! the coded concepts and display colour of that segment.

use crate::error::{ConversionError, Result};

use serde::Deserialize;
use serde_json::{Map, Value};
use std::{collections::HashSet, fs, path::Path};
use tracing::debug;

/// Validates a parsed mapping document before it is turned into a template
pub trait MappingValidator {
    fn validate(&self, document: &Value) -> bool;
}

impl<F> MappingValidator for F
where
    F: Fn(&Value) -> bool,
{
    fn validate(&self, document: &Value) -> bool {
        self(document)
    }
}

/// Structural validator for dcmqi segmentation meta-information
#[derive(Debug, Default, Clone, Copy)]
pub struct DcmqiSchema;

const TOP_LEVEL_STRINGS: [&str; 10] = [
    "ContentCreatorName",
    "ClinicalTrialSeriesID",
    "ClinicalTrialTimePointID",
    "ClinicalTrialCoordinatingCenterName",
    "SeriesDescription",
    "SeriesNumber",
    "InstanceNumber",
    "BodyPartExamined",
    "ContentLabel",
    "ContentDescription",
];

const SEGMENT_STRINGS: [&str; 3] = ["SegmentLabel", "SegmentDescription", "SegmentAlgorithmName"];

const ALGORITHM_TYPES: [&str; 3] = ["AUTOMATIC", "SEMIAUTOMATIC", "MANUAL"];

impl MappingValidator for DcmqiSchema {
    fn validate(&self, document: &Value) -> bool {
        let Some(root) = document.as_object() else {
            return false;
        };
        if !optional_strings(root, &TOP_LEVEL_STRINGS) {
            return false;
        }
        let Some(groups) = root.get("segmentAttributes").and_then(Value::as_array) else {
            return false;
        };
        !groups.is_empty()
            && groups.iter().all(|group| {
                group
                    .as_array()
                    .is_some_and(|segments| !segments.is_empty() && segments.iter().all(valid_segment))
            })
    }
}

fn optional_strings(object: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter()
        .all(|key| object.get(*key).is_none_or(Value::is_string))
}

fn valid_code(value: Option<&Value>) -> bool {
    value.and_then(Value::as_object).is_some_and(|code| {
        ["CodeValue", "CodingSchemeDesignator", "CodeMeaning"]
            .iter()
            .all(|key| code.get(*key).is_some_and(Value::is_string))
    })
}

fn valid_segment(segment: &Value) -> bool {
    let Some(segment) = segment.as_object() else {
        return false;
    };
    let label_id = segment.get("labelID").and_then(Value::as_u64);
    if !label_id.is_some_and(|id| (1..=u64::from(u16::MAX)).contains(&id)) {
        return false;
    }
    if !valid_code(segment.get("SegmentedPropertyCategoryCodeSequence"))
        || !valid_code(segment.get("SegmentedPropertyTypeCodeSequence"))
    {
        return false;
    }
    if !optional_strings(segment, &SEGMENT_STRINGS) {
        return false;
    }
    let algorithm_ok = segment
        .get("SegmentAlgorithmType")
        .is_none_or(|kind| kind.as_str().is_some_and(|kind| ALGORITHM_TYPES.contains(&kind)));
    let colour_ok = segment
        .get("recommendedDisplayRGBValue")
        .is_none_or(|rgb| {
            rgb.as_array().is_some_and(|rgb| {
                rgb.len() == 3
                    && rgb
                        .iter()
                        .all(|c| c.as_u64().is_some_and(|c| c <= u64::from(u8::MAX)))
            })
        });
    algorithm_ok && colour_ok
}

/// A coded concept (code value, scheme and meaning)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodedConcept {
    #[serde(rename = "CodeValue")]
    pub code_value: String,
    #[serde(rename = "CodingSchemeDesignator")]
    pub coding_scheme_designator: String,
    #[serde(rename = "CodeMeaning")]
    pub code_meaning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentDefinition {
    #[serde(rename = "labelID")]
    pub segment_number: u16,
    #[serde(rename = "SegmentLabel")]
    pub label: Option<String>,
    #[serde(rename = "SegmentDescription")]
    pub description: Option<String>,
    #[serde(rename = "SegmentAlgorithmType", default = "default_algorithm_type")]
    pub algorithm_type: String,
    #[serde(rename = "SegmentAlgorithmName")]
    pub algorithm_name: Option<String>,
    #[serde(rename = "SegmentedPropertyCategoryCodeSequence")]
    pub category: CodedConcept,
    #[serde(rename = "SegmentedPropertyTypeCodeSequence")]
    pub property_type: CodedConcept,
    #[serde(rename = "recommendedDisplayRGBValue")]
    pub display_rgb: Option<[u8; 3]>,
}

fn default_algorithm_type() -> String {
    "MANUAL".to_string()
}

impl SegmentDefinition {
    /// Label written to the output, falling back to the segment number
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| format!("Segment {}", self.segment_number))
    }
}

/// Series level attributes shared by every object of one conversion
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SeriesAttributes {
    #[serde(rename = "ContentCreatorName")]
    pub content_creator_name: Option<String>,
    #[serde(rename = "ClinicalTrialSeriesID")]
    pub clinical_trial_series_id: Option<String>,
    #[serde(rename = "ClinicalTrialTimePointID")]
    pub clinical_trial_time_point_id: Option<String>,
    #[serde(rename = "ClinicalTrialCoordinatingCenterName")]
    pub clinical_trial_coordinating_center_name: Option<String>,
    #[serde(rename = "SeriesDescription")]
    pub series_description: Option<String>,
    #[serde(rename = "SeriesNumber")]
    pub series_number: Option<String>,
    #[serde(rename = "InstanceNumber")]
    pub instance_number: Option<String>,
    #[serde(rename = "BodyPartExamined")]
    pub body_part_examined: Option<String>,
    #[serde(rename = "ContentLabel")]
    pub content_label: Option<String>,
    #[serde(rename = "ContentDescription")]
    pub content_description: Option<String>,
}

#[derive(Deserialize)]
struct MappingDocument {
    #[serde(flatten)]
    series: SeriesAttributes,
    #[serde(rename = "segmentAttributes")]
    segment_attributes: Vec<Vec<SegmentDefinition>>,
}

/// Immutable description of the segments of one conversion run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTemplate {
    series: SeriesAttributes,
    segments: Vec<SegmentDefinition>,
}

impl SegmentTemplate {
    /// Build a template from series attributes and segment definitions.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if a segment number is zero or
    /// declared more than once.
    pub fn new(
        series: SeriesAttributes,
        segments: Vec<SegmentDefinition>,
    ) -> std::result::Result<Self, String> {
        let mut seen = HashSet::new();
        for segment in &segments {
            if segment.segment_number == 0 {
                return Err("segment number 0 is reserved for background".to_string());
            }
            if !seen.insert(segment.segment_number) {
                return Err(format!(
                    "segment number {} declared more than once",
                    segment.segment_number
                ));
            }
        }
        Ok(Self { series, segments })
    }

    pub fn series(&self) -> &SeriesAttributes {
        &self.series
    }

    pub fn segments(&self) -> &[SegmentDefinition] {
        &self.segments
    }

    pub fn segment(&self, segment_number: u16) -> Option<&SegmentDefinition> {
        self.segments
            .iter()
            .find(|segment| segment.segment_number == segment_number)
    }

    pub fn contains(&self, segment_number: u16) -> bool {
        self.segment(segment_number).is_some()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Load and validate a segment mapping document
///
/// # Arguments
///
/// * `path` - Path to the mapping `.json`
/// * `validator` - Schema oracle the document must satisfy
///
/// # Errors
///
/// Returns `MissingResource` if the file does not exist and
/// `SchemaViolation` if it is not JSON, is rejected by the validator or
/// declares inconsistent segment numbers.
pub fn load_template(
    path: impl AsRef<Path>,
    validator: &impl MappingValidator,
) -> Result<SegmentTemplate> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConversionError::MissingResource(path.to_path_buf()));
    }

    let violation = |reason: String| ConversionError::SchemaViolation {
        path: path.to_path_buf(),
        reason,
    };

    let text = fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&text).map_err(|e| violation(e.to_string()))?;
    if !validator.validate(&document) {
        return Err(violation("rejected by schema validator".to_string()));
    }

    let MappingDocument {
        series,
        segment_attributes,
    } = serde_json::from_value(document).map_err(|e| violation(e.to_string()))?;
    let segments = segment_attributes.into_iter().flatten().collect();
    let template = SegmentTemplate::new(series, segments).map_err(violation)?;

    debug!(
        path = %path.display(),
        segments = template.len(),
        "loaded segment mapping"
    );
    Ok(template)
}
