use crate::{
    error::{ConversionError, Result},
    mapping::SegmentTemplate,
    volume::LabelVolume,
};

use tracing::debug;

/// Ensure every label in `volume` has a segment definition in `template`
///
/// # Errors
///
/// Returns `CapacityMismatch` if the template declares fewer segments than
/// the volume has distinct labels, otherwise `MissingSegmentDefinition` for
/// the smallest label without a definition.
pub fn check_labels(template: &SegmentTemplate, volume: &LabelVolume) -> Result<()> {
    let labels = volume.distinct_labels();

    if template.len() < labels.len() {
        return Err(ConversionError::CapacityMismatch {
            declared: template.len(),
            present: labels.len(),
        });
    }

    if let Some(&label) = labels
        .iter()
        .find(|&&label| !template.contains(u16::from(label)))
    {
        return Err(ConversionError::MissingSegmentDefinition(label));
    }

    debug!(labels = ?labels, "volume labels match the mapping");
    Ok(())
}
