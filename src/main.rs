use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use nii2seg::{
    Converter, ConverterOptions, SegmentationType, SortBy,
    source::{collect_dicom_files, has_variable_slice_thickness},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Convert a NIfTI segmentation into DICOM-SEG objects
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// the NIfTI label volume
    #[arg(short, long)]
    volume: PathBuf,

    /// the dcmqi style segment mapping `.json`
    #[arg(short, long)]
    mapping: PathBuf,

    /// directory holding the source DICOM slices
    #[arg(short, long, conflicts_with = "slice", required_unless_present = "slice")]
    dicom_dir: Option<PathBuf>,

    /// a source DICOM slice, repeat once per plane
    #[arg(short, long)]
    slice: Vec<PathBuf>,

    /// write one object for the whole volume
    #[arg(long)]
    multi_layer: bool,

    /// field used to order the source slices
    #[arg(long, value_enum, default_value_t = SortBy::InstanceNumber)]
    sort_by: SortBy,

    #[arg(long, value_enum, default_value_t = SegmentationType::MultiClass)]
    segmentation_type: SegmentationType,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> nii2seg::Result<()> {
    let slices = match &args.dicom_dir {
        Some(dir) => collect_dicom_files(dir)?,
        None => args.slice,
    };
    if has_variable_slice_thickness(&slices)? {
        warn!("source slices have variable slice thickness");
    }

    let converter = Converter::default().with_options(ConverterOptions {
        sort_by: args.sort_by,
        segmentation_type: args.segmentation_type,
    });
    let written = converter.convert(&args.volume, &args.mapping, &slices, args.multi_layer)?;

    info!(files = written.len(), "wrote segmentation objects");
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
