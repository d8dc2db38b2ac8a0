// amypet/src/cli.rs
//
// Command line definitions (Clap structs).

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use amypet::defs::Tracer;
use amypet::registration::CostFunction;

#[derive(Parser)]
#[command(name = "amypet")]
#[command(about = "Amyloid PET processing: classification, SUVr alignment, VOI sampling and Centiloid", long_about = None)]
#[command(version)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "AMYPET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by the commands that read PET series
#[derive(Args, Debug, Clone)]
pub struct SeriesArgs {
    /// Tracer, overriding detection (flute, fbb, fbp)
    #[arg(long)]
    pub tracer: Option<Tracer>,

    /// Output folder
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classifies the PET series found in a folder
    Explore {
        /// Folder with DICOM or NIfTI series
        input: PathBuf,

        #[command(flatten)]
        series: SeriesArgs,
    },

    /// Aligns the SUVr frames of a static series
    Align {
        input: PathBuf,

        #[command(flatten)]
        series: SeriesArgs,

        /// Index of the series to align (default: first static SUVr series)
        #[arg(long)]
        index: Option<usize>,

        /// Re-run even if aligned output exists
        #[arg(long)]
        force: bool,

        /// Registration cost function (mi, nmi, ecc, ncc)
        #[arg(long)]
        cost: Option<CostFunction>,
    },

    /// Sums frames of a dynamic image into a static image
    Static {
        /// NIfTI file or DICOM folder
        pet: PathBuf,

        /// Frame indices to sum (default: all)
        #[arg(long, value_delimiter = ',')]
        frames: Vec<usize>,

        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Core name of the static file
        #[arg(long)]
        fname: Option<String>,

        /// Skip the centre-of-mass corrected copy
        #[arg(long)]
        no_com: bool,
    },

    /// Extracts VOI statistics from a PET image and labels in the same space
    Vois {
        pet: PathBuf,

        /// Parcellation image
        labels: PathBuf,

        /// Atlas mask restricting the VOIs
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Folder for VOI mask files
        #[arg(long)]
        masks_out: Option<PathBuf>,

        /// JSON report file
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// SUVr processing of a PET image with a T1w image and its parcellation
    Suvr {
        pet: PathBuf,

        #[arg(long)]
        t1w: PathBuf,

        #[arg(long)]
        labels: PathBuf,

        #[arg(long, value_delimiter = ',')]
        frames: Vec<usize>,

        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Converts an SUVr value to Centiloid
    Centiloid {
        suvr: f64,

        /// Tracer calibration to use
        #[arg(long, conflicts_with = "anchors")]
        tracer: Option<Tracer>,

        /// Young-control and AD anchor SUVr values
        #[arg(long, num_args = 2, value_names = ["YC", "AD"])]
        anchors: Option<Vec<f64>>,
    },

    /// Runs the full pipeline
    Run {
        input: PathBuf,

        #[arg(long)]
        t1w: PathBuf,

        #[arg(long)]
        labels: PathBuf,

        #[command(flatten)]
        series: SeriesArgs,
    },
}
