use crate::{
    error::{ConversionError, Result},
    mapping::SegmentTemplate,
};

use dicom::core::{DataElement, PrimitiveValue, Tag, VR, dicom_value, value::DataSetSequence};
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom_dictionary_std::tags;
use ndarray::{ArrayView2, ArrayView3, Axis};
use std::borrow::Cow;
use tracing::warn;

/// Encoded segmentation object, ready to be written to disk
pub type OutputObject = FileDicomObject<InMemDicomObject>;

/// Turns labels plus source metadata into an output object.
///
/// `labels` is indexed `(x, y, plane)` and `sources[i]` is the metadata of
/// the slice plane `i` was derived from.
pub trait SegmentationEncoder {
    fn encode(
        &self,
        template: &SegmentTemplate,
        labels: ArrayView3<'_, u8>,
        sources: &[InMemDicomObject],
    ) -> Result<OutputObject>;
}

impl<E: SegmentationEncoder + ?Sized> SegmentationEncoder for &E {
    fn encode(
        &self,
        template: &SegmentTemplate,
        labels: ArrayView3<'_, u8>,
        sources: &[InMemDicomObject],
    ) -> Result<OutputObject> {
        (**self).encode(template, labels, sources)
    }
}

/// Wraps a [`SegmentationEncoder`], fixing up the metadata it consumes and
/// produces.
pub struct PlaneEncoder<E> {
    encoder: E,
}

impl<E: SegmentationEncoder> PlaneEncoder<E> {
    pub fn new(encoder: E) -> Self {
        Self { encoder }
    }

    pub fn inner(&self) -> &E {
        &self.encoder
    }

    /// Encode a single plane derived from `source`
    pub fn encode_plane(
        &self,
        template: &SegmentTemplate,
        plane: ArrayView2<'_, u8>,
        source: &InMemDicomObject,
    ) -> Result<OutputObject> {
        self.encode_with_sources(
            template,
            plane.insert_axis(Axis(2)),
            std::slice::from_ref(source),
        )
    }

    /// Encode a whole volume; `sources` must be in plane order
    pub fn encode_volume(
        &self,
        template: &SegmentTemplate,
        volume: ArrayView3<'_, u8>,
        sources: &[InMemDicomObject],
    ) -> Result<OutputObject> {
        self.encode_with_sources(template, volume, sources)
    }

    /// Overlapping-class encoding is not supported
    pub fn encode_multilabel(
        &self,
        _template: &SegmentTemplate,
        _volume: ArrayView3<'_, u8>,
        _sources: &[InMemDicomObject],
    ) -> Result<OutputObject> {
        Err(ConversionError::Unimplemented(
            "multi-label segmentation encoding",
        ))
    }

    fn encode_with_sources(
        &self,
        template: &SegmentTemplate,
        labels: ArrayView3<'_, u8>,
        sources: &[InMemDicomObject],
    ) -> Result<OutputObject> {
        let first = sources
            .first()
            .ok_or_else(|| ConversionError::EncodeFailure("no source metadata".to_string()))?;

        let patched = sources
            .iter()
            .any(|source| source.element(tags::IMAGE_POSITION_PATIENT).is_err());
        let sources: Cow<'_, [InMemDicomObject]> = if patched {
            warn!("source slice has no image position, encoding with a placeholder origin");
            Cow::Owned(sources.iter().map(with_placeholder_position).collect())
        } else {
            Cow::Borrowed(sources)
        };

        let mut output = self
            .encoder
            .encode(template, labels, &sources)
            .map_err(|e| match e {
                ConversionError::EncodeFailure(_) => e,
                other => ConversionError::EncodeFailure(other.to_string()),
            })?;

        if patched {
            strip_plane_positions(&mut output);
        }
        copy_acquisition_time(&mut output, first);
        Ok(output)
    }
}

fn with_placeholder_position(source: &InMemDicomObject) -> InMemDicomObject {
    let mut source = source.clone();
    if source.element(tags::IMAGE_POSITION_PATIENT).is_err() {
        source.put(DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["0".to_string(), "0".to_string(), "0".to_string()]),
        ));
    }
    source
}

/// Remove every plane position the encoder may have written, along with
/// any dimension index that points into the removed functional group
fn strip_plane_positions(output: &mut InMemDicomObject) {
    output.remove_element(tags::IMAGE_POSITION_PATIENT);
    for groups in [
        tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
        tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE,
    ] {
        update_items(output, groups, |group| {
            group.remove_element(tags::PLANE_POSITION_SEQUENCE);
        });
    }

    let dropped: Vec<usize> = output
        .element(tags::DIMENSION_INDEX_SEQUENCE)
        .ok()
        .and_then(|e| e.value().items())
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter(|(_, index)| points_to_plane_position(index))
                .map(|(i, _)| i)
                .collect()
        })
        .unwrap_or_default();
    if dropped.is_empty() {
        return;
    }

    let kept: Vec<InMemDicomObject> = output
        .element(tags::DIMENSION_INDEX_SEQUENCE)
        .ok()
        .and_then(|e| e.value().items())
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter(|(i, _)| !dropped.contains(i))
                .map(|(_, index)| index.clone())
                .collect()
        })
        .unwrap_or_default();
    output.put(DataElement::new(
        tags::DIMENSION_INDEX_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(kept),
    ));
    update_items(output, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, |group| {
        update_items(group, tags::FRAME_CONTENT_SEQUENCE, |content| {
            let Some(values) = content
                .element(tags::DIMENSION_INDEX_VALUES)
                .ok()
                .and_then(|e| e.to_multi_int::<u32>().ok())
            else {
                return;
            };
            let kept: Vec<u32> = values
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !dropped.contains(i))
                .map(|(_, v)| v)
                .collect();
            content.put(DataElement::new(
                tags::DIMENSION_INDEX_VALUES,
                VR::UL,
                PrimitiveValue::U32(kept.into()),
            ));
        });
    });
}

fn points_to_plane_position(index: &InMemDicomObject) -> bool {
    let pointer = |tag| {
        index
            .element(tag)
            .ok()
            .and_then(|e| e.value().primitive())
            .and_then(|value| match value {
                PrimitiveValue::Tags(pointers) => pointers.first().copied(),
                _ => None,
            })
    };
    pointer(tags::FUNCTIONAL_GROUP_POINTER) == Some(tags::PLANE_POSITION_SEQUENCE)
        || pointer(tags::DIMENSION_INDEX_POINTER) == Some(tags::IMAGE_POSITION_PATIENT)
}

fn update_items(
    object: &mut InMemDicomObject,
    tag: Tag,
    mut f: impl FnMut(&mut InMemDicomObject),
) {
    let Some(mut items) = object
        .element(tag)
        .ok()
        .and_then(|e| e.value().items())
        .map(<[InMemDicomObject]>::to_vec)
    else {
        return;
    };
    items.iter_mut().for_each(&mut f);
    object.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
}

fn copy_acquisition_time(output: &mut InMemDicomObject, source: &InMemDicomObject) {
    match source.element(tags::ACQUISITION_TIME) {
        Ok(time) => {
            output.put(time.clone());
        }
        Err(_) => {
            output.remove_element(tags::ACQUISITION_TIME);
        }
    }
}
