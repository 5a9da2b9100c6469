use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use dicom_seg::{
    Device, LabelCatalog, LabelVolume, OutputFormat, PropertyTypeCoding, SegOptions,
    SegmentationFlavor, SeriesNumbering, Task,
    engine::{Dcm2NiixCommand, EngineRequest, TotalSegmentatorCommand, prepare_dicom_input},
    export_segmentation, segment_dicom_series,
};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputType {
    Seg,
    Rtstruct,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Flavor {
    Binary,
    Labelmap,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeriesNumber {
    Copy,
    Offset,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PropertyType {
    Generic,
    Name,
}

/// Process a DICOM series and output a DICOM Segmentation or RT Structure Set.
#[derive(Debug, Parser)]
#[command(version, after_help = "Based on TotalSegmentator by Jakob Wasserthal.")]
struct Cli {
    /// Directory or zip archive containing the DICOM series
    #[arg(short, long = "input", value_name = "DIRECTORY")]
    input: PathBuf,

    /// Output DICOM file
    #[arg(short, long = "output", value_name = "FILEPATH")]
    output: PathBuf,

    /// Write a DICOM Segmentation or an RT Structure Set
    #[arg(long, value_enum, default_value_t = OutputType::Seg)]
    output_type: OutputType,

    /// Run faster lower resolution model (3mm)
    #[arg(short, long)]
    fast: bool,

    /// Run even faster lower resolution model (6mm)
    #[arg(long)]
    fastest: bool,

    /// Select which model to use. This determines what is predicted.
    #[arg(short, long, default_value = "total", value_parser = parse_task)]
    task: Task,

    /// Define a subset of classes to save
    #[arg(long = "roi-subset", alias = "roi_subset", num_args = 1..)]
    roi_subset: Option<Vec<String>>,

    /// Device to run on
    #[arg(short, long, default_value = "gpu", value_parser = parse_device)]
    device: Device,

    /// Existing multilabel NIfTI file; skips conversion and segmentation
    #[arg(long, value_name = "NIFTI")]
    labels: Option<PathBuf>,

    /// JSON array with the class names of the task, label 1 first
    #[arg(long, value_name = "JSON")]
    class_map: Option<PathBuf>,

    /// Pixel data encoding of the segmentation
    #[arg(long, value_enum, default_value_t = Flavor::Binary)]
    flavor: Flavor,

    /// Copy the source series number or offset it
    #[arg(long, value_enum, default_value_t = SeriesNumber::Copy)]
    series_number: SeriesNumber,

    /// Offset added to the source series number in offset mode
    #[arg(long, default_value_t = SeriesNumbering::DEFAULT_OFFSET)]
    series_number_offset: i32,

    /// Coding of the segmented property type
    #[arg(long, value_enum, default_value_t = PropertyType::Generic)]
    property_type: PropertyType,

    /// TotalSegmentator version recorded in the output
    #[arg(long)]
    engine_version: Option<String>,

    /// Show more intermediate output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_task(s: &str) -> Result<Task, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_device(s: &str) -> Result<Device, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn read_class_map(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("{} is not a JSON array of class names", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let request = EngineRequest {
        task: cli.task,
        roi_subset: cli.roi_subset.clone(),
        device: cli.device,
        fast: cli.fast,
        fastest: cli.fastest,
    };
    request.validate()?;

    let mut options = SegOptions {
        output_format: match cli.output_type {
            OutputType::Seg => OutputFormat::Seg,
            OutputType::Rtstruct => OutputFormat::RtStruct,
        },
        flavor: match cli.flavor {
            Flavor::Binary => SegmentationFlavor::Binary,
            Flavor::Labelmap => SegmentationFlavor::Labelmap,
        },
        series_numbering: match cli.series_number {
            SeriesNumber::Copy => SeriesNumbering::CopySource,
            SeriesNumber::Offset => SeriesNumbering::Offset(cli.series_number_offset),
        },
        property_type: match cli.property_type {
            PropertyType::Generic => PropertyTypeCoding::Generic,
            PropertyType::Name => PropertyTypeCoding::FromName,
        },
        ..SegOptions::default()
    };
    if let Some(version) = cli.engine_version {
        options.software_version = version;
    }

    let class_names = match &cli.class_map {
        Some(path) => read_class_map(path)?,
        None => Vec::new(),
    };

    match &cli.labels {
        Some(labels_path) => {
            let catalog = match &cli.roi_subset {
                Some(subset) => LabelCatalog::from_class_names(subset.iter().cloned()),
                None if class_names.is_empty() => {
                    bail!("--labels needs either --class-map or --roi-subset")
                }
                None => LabelCatalog::from_class_names(class_names),
            };
            let labels = LabelVolume::from_nifti(labels_path)
                .with_context(|| format!("Failed to read {}", labels_path.display()))?;

            let scratch = tempfile::tempdir()?;
            let dicom_dir = prepare_dicom_input(&cli.input, scratch.path())?;
            export_segmentation(&labels, &catalog, &dicom_dir, &cli.output, &options)?;
        }
        None => {
            let engine = TotalSegmentatorCommand {
                verbose: cli.verbose,
                ..TotalSegmentatorCommand::new(class_names)
            };
            segment_dicom_series(
                &cli.input,
                &cli.output,
                &request,
                &Dcm2NiixCommand::default(),
                &engine,
                &options,
            )?;
        }
    }

    info!("DICOM output saved to: {}", cli.output.display());
    Ok(())
}
