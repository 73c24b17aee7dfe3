//! Built-in DICOM Segmentation Storage encoder.
//!
//! Writes BINARY segmentations: one bit-packed frame per (segment, plane)
//! pair that holds at least one voxel of the segment. Frames are ordered by
//! segment number, then by plane. A plane `(x, y)` becomes a frame with
//! `Rows = y` and `Columns = x`.

use crate::{
    encoder::{OutputObject, SegmentationEncoder},
    error::{ConversionError, Result},
    mapping::{CodedConcept, SegmentDefinition, SegmentTemplate},
};

use dicom::core::{DataElement, PrimitiveValue, Tag, VR, dicom_value, value::DataSetSequence};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, mem::InMemElement};
use dicom_dictionary_std::tags;
use ndarray::{ArrayView2, ArrayView3, s};
use uuid::Uuid;

pub const SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.4";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// Patient and study attributes carried over from the first source slice
const INHERITED: [Tag; 13] = [
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::FRAME_OF_REFERENCE_UID,
    tags::POSITION_REFERENCE_INDICATOR,
    tags::BODY_PART_EXAMINED,
];

#[derive(Debug, Clone)]
pub struct SegWriter {
    pub manufacturer: String,
    pub software_version: String,
}

impl Default for SegWriter {
    fn default() -> Self {
        Self {
            manufacturer: "nii2seg".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    /// Position of the segment in the written segment sequence, 1-based
    segment_index: u32,
    segment_number: u16,
    plane: usize,
}

/// Globally unique UID under the `2.25` UUID root
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

impl SegmentationEncoder for SegWriter {
    fn encode(
        &self,
        template: &SegmentTemplate,
        labels: ArrayView3<'_, u8>,
        sources: &[InMemDicomObject],
    ) -> Result<OutputObject> {
        let (width, height, planes) = labels.dim();
        if sources.len() != planes {
            return Err(ConversionError::EncodeFailure(format!(
                "{} source slices for {planes} planes",
                sources.len()
            )));
        }
        let first = sources
            .first()
            .ok_or_else(|| ConversionError::EncodeFailure("no source slices".to_string()))?;
        let rows = u16::try_from(height)
            .map_err(|_| ConversionError::EncodeFailure("too many rows".to_string()))?;
        let columns = u16::try_from(width)
            .map_err(|_| ConversionError::EncodeFailure("too many columns".to_string()))?;

        // an all-background volume encodes to an object without frames
        let (segments, frames) = Self::collect_frames(template, labels);

        let sop_instance_uid = generate_uid();
        let mut obj = InMemDicomObject::new_empty();
        put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, SEGMENTATION_STORAGE);
        put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, &sop_instance_uid);
        put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, &generate_uid());
        put_str(&mut obj, tags::MODALITY, VR::CS, "SEG");
        put_str(&mut obj, tags::MANUFACTURER, VR::LO, &self.manufacturer);
        put_str(&mut obj, tags::SOFTWARE_VERSIONS, VR::LO, &self.software_version);

        for tag in INHERITED {
            copy_element(&mut obj, first, tag);
        }
        Self::put_series_attributes(&mut obj, template);

        obj.put(DataElement::new(
            tags::IMAGE_TYPE,
            VR::CS,
            dicom_value!(Strs, ["DERIVED".to_string(), "PRIMARY".to_string()]),
        ));
        put_str(&mut obj, tags::SEGMENTATION_TYPE, VR::CS, "BINARY");
        put_u16(&mut obj, tags::SAMPLES_PER_PIXEL, 1);
        put_str(&mut obj, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");
        put_u16(&mut obj, tags::ROWS, rows);
        put_u16(&mut obj, tags::COLUMNS, columns);
        put_u16(&mut obj, tags::BITS_ALLOCATED, 1);
        put_u16(&mut obj, tags::BITS_STORED, 1);
        put_u16(&mut obj, tags::HIGH_BIT, 0);
        put_u16(&mut obj, tags::PIXEL_REPRESENTATION, 0);
        put_str(&mut obj, tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00");
        put_str(
            &mut obj,
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            &frames.len().to_string(),
        );

        obj.put(sequence(
            tags::SEGMENT_SEQUENCE,
            segments.iter().map(|segment| segment_item(segment)).collect(),
        ));
        obj.put(Self::dimension_index_sequence());
        obj.put(sequence(
            tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE,
            vec![Self::shared_functional_groups(first)],
        ));
        obj.put(sequence(
            tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
            frames
                .iter()
                .map(|frame| Self::frame_functional_groups(frame, &sources[frame.plane]))
                .collect::<Result<_>>()?,
        ));
        obj.put(Self::referenced_series(first, sources)?);

        let pixel_data = pack_frames(labels, &frames);
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(pixel_data),
        ));

        obj.with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(SEGMENTATION_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid)
                .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN),
        )
        .map_err(|e| ConversionError::EncodeFailure(e.to_string()))
    }
}

impl SegWriter {
    fn collect_frames<'t>(
        template: &'t SegmentTemplate,
        labels: ArrayView3<'_, u8>,
    ) -> (Vec<&'t SegmentDefinition>, Vec<Frame>) {
        let mut definitions: Vec<_> = template.segments().iter().collect();
        definitions.sort_by_key(|segment| segment.segment_number);

        let mut segments = Vec::new();
        let mut frames = Vec::new();
        for segment in definitions {
            let planes: Vec<_> = (0..labels.dim().2)
                .filter(|&plane| {
                    labels
                        .slice(s![.., .., plane])
                        .iter()
                        .any(|&v| u16::from(v) == segment.segment_number)
                })
                .collect();
            if planes.is_empty() {
                continue;
            }
            segments.push(segment);
            let segment_index = segments.len() as u32;
            frames.extend(planes.into_iter().map(|plane| Frame {
                segment_index,
                segment_number: segment.segment_number,
                plane,
            }));
        }
        (segments, frames)
    }

    fn put_series_attributes(obj: &mut InMemDicomObject, template: &SegmentTemplate) {
        let series = template.series();
        let fields = [
            (tags::SERIES_NUMBER, VR::IS, series.series_number.as_deref().or(Some("300"))),
            (tags::INSTANCE_NUMBER, VR::IS, series.instance_number.as_deref().or(Some("1"))),
            (tags::SERIES_DESCRIPTION, VR::LO, series.series_description.as_deref()),
            (
                tags::CONTENT_LABEL,
                VR::CS,
                series.content_label.as_deref().or(Some("SEGMENTATION")),
            ),
            (tags::CONTENT_DESCRIPTION, VR::LO, series.content_description.as_deref()),
            (tags::CONTENT_CREATOR_NAME, VR::PN, series.content_creator_name.as_deref()),
            (tags::BODY_PART_EXAMINED, VR::CS, series.body_part_examined.as_deref()),
            (
                tags::CLINICAL_TRIAL_SERIES_ID,
                VR::LO,
                series.clinical_trial_series_id.as_deref(),
            ),
            (
                tags::CLINICAL_TRIAL_TIME_POINT_ID,
                VR::LO,
                series.clinical_trial_time_point_id.as_deref(),
            ),
            (
                tags::CLINICAL_TRIAL_COORDINATING_CENTER_NAME,
                VR::LO,
                series.clinical_trial_coordinating_center_name.as_deref(),
            ),
        ];
        for (tag, vr, value) in fields {
            if let Some(value) = value {
                put_str(obj, tag, vr, value);
            }
        }
    }

    fn dimension_index_sequence() -> InMemElement {
        let organization = generate_uid();
        let index = |pointer: Tag, group: Tag| {
            InMemDicomObject::from_element_iter([
                DataElement::new(
                    tags::DIMENSION_ORGANIZATION_UID,
                    VR::UI,
                    PrimitiveValue::from(organization.as_str()),
                ),
                DataElement::new(
                    tags::DIMENSION_INDEX_POINTER,
                    VR::AT,
                    dicom_value!(Tags, [pointer]),
                ),
                DataElement::new(
                    tags::FUNCTIONAL_GROUP_POINTER,
                    VR::AT,
                    dicom_value!(Tags, [group]),
                ),
            ])
        };
        sequence(
            tags::DIMENSION_INDEX_SEQUENCE,
            vec![
                index(
                    tags::REFERENCED_SEGMENT_NUMBER,
                    tags::SEGMENT_IDENTIFICATION_SEQUENCE,
                ),
                index(tags::IMAGE_POSITION_PATIENT, tags::PLANE_POSITION_SEQUENCE),
            ],
        )
    }

    fn shared_functional_groups(first: &InMemDicomObject) -> InMemDicomObject {
        let mut group = InMemDicomObject::new_empty();

        let mut measures = InMemDicomObject::new_empty();
        for tag in [
            tags::PIXEL_SPACING,
            tags::SLICE_THICKNESS,
            tags::SPACING_BETWEEN_SLICES,
        ] {
            copy_element(&mut measures, first, tag);
        }
        if measures.iter().next().is_some() {
            group.put(sequence(tags::PIXEL_MEASURES_SEQUENCE, vec![measures]));
        }

        if let Ok(orientation) = first.element(tags::IMAGE_ORIENTATION_PATIENT) {
            group.put(sequence(
                tags::PLANE_ORIENTATION_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([orientation.clone()])],
            ));
        }
        group
    }

    fn frame_functional_groups(frame: &Frame, source: &InMemDicomObject) -> Result<InMemDicomObject> {
        let source_image = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::REFERENCED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(required_str(source, tags::SOP_CLASS_UID)?),
            ),
            DataElement::new(
                tags::REFERENCED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(required_str(source, tags::SOP_INSTANCE_UID)?),
            ),
            sequence(
                tags::PURPOSE_OF_REFERENCE_CODE_SEQUENCE,
                vec![code_item(
                    "121322",
                    "DCM",
                    "Source image for image processing operation",
                )],
            ),
        ]);
        let derivation = InMemDicomObject::from_element_iter([
            sequence(tags::SOURCE_IMAGE_SEQUENCE, vec![source_image]),
            sequence(
                tags::DERIVATION_CODE_SEQUENCE,
                vec![code_item("113076", "DCM", "Segmentation")],
            ),
        ]);
        let content = InMemDicomObject::from_element_iter([DataElement::new(
            tags::DIMENSION_INDEX_VALUES,
            VR::UL,
            dicom_value!(U32, [frame.segment_index, frame.plane as u32 + 1]),
        )]);
        let identification = InMemDicomObject::from_element_iter([DataElement::new(
            tags::REFERENCED_SEGMENT_NUMBER,
            VR::US,
            PrimitiveValue::from(frame.segment_number),
        )]);

        let mut group = InMemDicomObject::from_element_iter([
            sequence(tags::DERIVATION_IMAGE_SEQUENCE, vec![derivation]),
            sequence(tags::FRAME_CONTENT_SEQUENCE, vec![content]),
            sequence(tags::SEGMENT_IDENTIFICATION_SEQUENCE, vec![identification]),
        ]);
        if let Ok(position) = source.element(tags::IMAGE_POSITION_PATIENT) {
            group.put(sequence(
                tags::PLANE_POSITION_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([position.clone()])],
            ));
        }
        Ok(group)
    }

    fn referenced_series(
        first: &InMemDicomObject,
        sources: &[InMemDicomObject],
    ) -> Result<InMemElement> {
        let instances = sources
            .iter()
            .map(|source| {
                Ok(InMemDicomObject::from_element_iter([
                    DataElement::new(
                        tags::REFERENCED_SOP_CLASS_UID,
                        VR::UI,
                        PrimitiveValue::from(required_str(source, tags::SOP_CLASS_UID)?),
                    ),
                    DataElement::new(
                        tags::REFERENCED_SOP_INSTANCE_UID,
                        VR::UI,
                        PrimitiveValue::from(required_str(source, tags::SOP_INSTANCE_UID)?),
                    ),
                ]))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut series = InMemDicomObject::new_empty();
        copy_element(&mut series, first, tags::SERIES_INSTANCE_UID);
        series.put(sequence(tags::REFERENCED_INSTANCE_SEQUENCE, instances));
        Ok(sequence(tags::REFERENCED_SERIES_SEQUENCE, vec![series]))
    }
}

fn segment_item(segment: &SegmentDefinition) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    item.put(DataElement::new(
        tags::SEGMENT_NUMBER,
        VR::US,
        PrimitiveValue::from(segment.segment_number),
    ));
    put_str(&mut item, tags::SEGMENT_LABEL, VR::LO, &segment.display_label());
    if let Some(description) = &segment.description {
        put_str(&mut item, tags::SEGMENT_DESCRIPTION, VR::ST, description);
    }
    put_str(
        &mut item,
        tags::SEGMENT_ALGORITHM_TYPE,
        VR::CS,
        &segment.algorithm_type,
    );
    if segment.algorithm_type != "MANUAL" {
        let name = segment.algorithm_name.as_deref().unwrap_or("unknown");
        put_str(&mut item, tags::SEGMENT_ALGORITHM_NAME, VR::LO, name);
    }
    item.put(sequence(
        tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE,
        vec![concept_item(&segment.category)],
    ));
    item.put(sequence(
        tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE,
        vec![concept_item(&segment.property_type)],
    ));
    if let Some(rgb) = segment.display_rgb {
        let [l, a, b] = rgb_to_dicom_lab(rgb);
        item.put(DataElement::new(
            tags::RECOMMENDED_DISPLAY_CIE_LAB_VALUE,
            VR::US,
            dicom_value!(U16, [l, a, b]),
        ));
    }
    item
}

fn concept_item(concept: &CodedConcept) -> InMemDicomObject {
    code_item(
        &concept.code_value,
        &concept.coding_scheme_designator,
        &concept.code_meaning,
    )
}

fn code_item(value: &str, scheme: &str, meaning: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::CODE_VALUE, VR::SH, PrimitiveValue::from(value)),
        DataElement::new(
            tags::CODING_SCHEME_DESIGNATOR,
            VR::SH,
            PrimitiveValue::from(scheme),
        ),
        DataElement::new(tags::CODE_MEANING, VR::LO, PrimitiveValue::from(meaning)),
    ])
}

fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
}

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn put_u16(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
}

fn copy_element(target: &mut InMemDicomObject, source: &InMemDicomObject, tag: Tag) {
    if let Ok(element) = source.element(tag) {
        target.put(element.clone());
    }
}

fn required_str(source: &InMemDicomObject, tag: Tag) -> Result<String> {
    source
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ConversionError::EncodeFailure(format!("source slice has no {tag} attribute"))
        })
}

/// Pack frames LSB first into one continuous bit stream, padded to even length
fn pack_frames(labels: ArrayView3<'_, u8>, frames: &[Frame]) -> Vec<u8> {
    let (width, height, _) = labels.dim();
    let frame_bits = width * height;
    let total_bits = frame_bits * frames.len();
    let mut bytes = vec![0u8; total_bits.div_ceil(8)];
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }

    for (f, frame) in frames.iter().enumerate() {
        let plane: ArrayView2<'_, u8> = labels.slice(s![.., .., frame.plane]);
        for row in 0..height {
            for column in 0..width {
                if u16::from(plane[[column, row]]) == frame.segment_number {
                    let bit = f * frame_bits + row * width + column;
                    bytes[bit / 8] |= 1 << (bit % 8);
                }
            }
        }
    }
    bytes
}

/// sRGB to CIELab (D65), scaled to the DICOM 16-bit encoding
fn rgb_to_dicom_lab(rgb: [u8; 3]) -> [u16; 3] {
    let linear = rgb.map(|c| {
        let c = f64::from(c) / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    });
    let [r, g, b] = linear;
    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;

    let f = |t: f64| {
        if t > 216.0 / 24389.0 {
            t.cbrt()
        } else {
            (24389.0 / 27.0 * t + 16.0) / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let b = 200.0 * (fy - fz);

    let scale = |v: f64, lo: f64, hi: f64| {
        ((v.clamp(lo, hi) - lo) / (hi - lo) * 65535.0).round() as u16
    };
    [
        scale(l, 0.0, 100.0),
        scale(a, -128.0, 127.0),
        scale(b, -128.0, 127.0),
    ]
}
