use clap::{Args as ClapArgs, Parser, Subcommand};
use finish_line::pipeline::calibration::Calibration;
use finish_line::pipeline::types::Direction;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print container metadata as JSON
    Probe { video: PathBuf },

    /// Export the first frame with the sampling line drawn
    Preview {
        video: PathBuf,

        #[command(flatten)]
        calibration: CalibrationArgs,

        /// Output PNG path
        #[arg(long, default_value = "preview.png")]
        out: PathBuf,

        /// Apply the full rotation so the line is vertical
        #[arg(long)]
        corrected: bool,
    },

    /// Reconstruct the finish-line raster from a video
    Scan {
        video: PathBuf,

        #[command(flatten)]
        calibration: CalibrationArgs,

        /// Root directory for run directories
        #[arg(long, env = "FINISH_LINE_OUTPUT_ROOT", default_value = "runs")]
        output_root: PathBuf,

        /// Worker thread count (defaults to available parallelism)
        #[arg(long, env = "FINISH_LINE_WORKERS")]
        workers: Option<usize>,

        /// Frames per real second, overriding container metadata
        #[arg(long)]
        fps: Option<f64>,

        /// Start of recording, `HH:MM:SS[.f]` or a full date-time
        #[arg(long)]
        start_time: Option<String>,

        /// Offset applied to the container creation time, e.g. `+02:00`
        #[arg(long, default_value = "Z")]
        utc_offset: String,

        /// Raster file name inside the run directory
        #[arg(long)]
        raster_name: Option<String>,

        /// Reuse an existing run directory
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the timestamp of a raster column
    Time { run_dir: PathBuf, column: usize },

    /// Record a bib at the timestamp of a raster column
    Bib {
        run_dir: PathBuf,
        column: usize,
        identifier: String,

        /// Ledger file, defaults to the run's ledger
        #[arg(long)]
        ledger: Option<PathBuf>,
    },

    /// List recorded bibs for a run
    Bibs {
        run_dir: PathBuf,

        #[arg(long)]
        ledger: Option<PathBuf>,
    },

    /// List finished runs
    Runs {
        #[arg(long, env = "FINISH_LINE_OUTPUT_ROOT", default_value = "runs")]
        output_root: PathBuf,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CalibrationArgs {
    /// Sampling line x position in the calibrated frame (defaults to centre)
    #[arg(long)]
    pub line: Option<u32>,

    /// Horizontal offset of the line ends, in pixels
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub skew: i32,

    /// Counter-clockwise quarter turns (negative for clockwise)
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub quarter_turns: i32,

    /// Direction of travel: forward (left to right) or reverse
    #[arg(long, default_value = "forward")]
    pub direction: Direction,
}

impl CalibrationArgs {
    pub fn to_calibration(&self, width: u32, height: u32) -> Calibration {
        let cal = Calibration::new(width, height)
            .with_quarter_turns(self.quarter_turns)
            .with_skew(self.skew)
            .with_direction(self.direction);
        let line = self.line.unwrap_or(cal.frame_width() / 2);
        cal.with_line_position(line)
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
