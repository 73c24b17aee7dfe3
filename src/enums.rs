use clap::ValueEnum;

/// Field used to recover the acquisition order of source slices
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortBy {
    #[default]
    InstanceNumber,
    ImagePositionPatient,
    TablePosition,
    AcquisitionNumber,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputStrategy {
    /// One output object per non-empty plane
    #[default]
    SingleLayer,
    /// One output object for the whole volume
    MultiLayer,
}

impl From<bool> for OutputStrategy {
    fn from(multi_layer: bool) -> Self {
        if multi_layer {
            OutputStrategy::MultiLayer
        } else {
            OutputStrategy::SingleLayer
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SegmentationType {
    /// Every voxel carries at most one label
    #[default]
    MultiClass,
    // Overlapping classes, not supported by the encoder yet
    MultiLabel,
}
