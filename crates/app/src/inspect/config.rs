use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use inspect_core::{AverageMethod, CircleParams, EngineParams, RegistrationParams, Roi};

pub const USAGE: &str = "Usage: opticheck run --reference <path> [--mode single|station] \
[--select <side|top|bottom>] [--mask <path>] [--roi <name:x,y,w,h>]... \
[--device <uri>] [--width <px>] [--height <px>] [--fps <hz>] \
[--capture-width <px>] [--capture-height <px>] [--frames <n>] \
[--method mean|median] [--equalize] [--smooth] [--flip-h] [--flip-v] \
[--diff-threshold <0..1>] [--min-matches <n>] [--output <dir>] \
[--cycles <n>] [--verbose]";

/// Read-only configuration for one station run.
#[derive(Clone, Debug)]
pub struct StationConfig {
    pub device: String,
    pub preview_width: u32,
    pub preview_height: u32,
    pub fps: f32,
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub frames_per_capture: usize,
    pub method: AverageMethod,
    pub equalize: bool,
    pub smooth: bool,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub mode: String,
    pub selector: String,
    pub reference: Option<PathBuf>,
    pub mask: Option<PathBuf>,
    pub rois: Vec<(String, Roi)>,
    pub diff_threshold: f32,
    pub min_matches: usize,
    pub output_dir: PathBuf,
    pub cycles: u32,
    pub verbose: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            preview_width: 640,
            preview_height: 480,
            fps: 15.0,
            capture_width: None,
            capture_height: None,
            frames_per_capture: 5,
            method: AverageMethod::Mean,
            equalize: false,
            smooth: false,
            flip_horizontal: false,
            flip_vertical: false,
            mode: "single".to_string(),
            selector: "front".to_string(),
            reference: None,
            mask: None,
            rois: Vec::new(),
            diff_threshold: 0.15,
            min_matches: 8,
            output_dir: PathBuf::from("inspection_out"),
            cycles: 1,
            verbose: false,
        }
    }
}

impl StationConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut idx = 2;
        while idx < args.len() {
            match args[idx].as_str() {
                "--device" => {
                    idx += 1;
                    config.device = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--device requires a value"))?
                        .clone();
                    idx += 1;
                }
                "--width" => {
                    idx += 1;
                    config.preview_width = parse_value(args, idx, "--width")?;
                    idx += 1;
                }
                "--height" => {
                    idx += 1;
                    config.preview_height = parse_value(args, idx, "--height")?;
                    idx += 1;
                }
                "--fps" => {
                    idx += 1;
                    config.fps = parse_value(args, idx, "--fps")?;
                    idx += 1;
                }
                "--capture-width" => {
                    idx += 1;
                    config.capture_width = Some(parse_value(args, idx, "--capture-width")?);
                    idx += 1;
                }
                "--capture-height" => {
                    idx += 1;
                    config.capture_height = Some(parse_value(args, idx, "--capture-height")?);
                    idx += 1;
                }
                "--frames" => {
                    idx += 1;
                    config.frames_per_capture = parse_value(args, idx, "--frames")?;
                    idx += 1;
                }
                "--method" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--method requires a value"))?;
                    config.method = AverageMethod::parse(value)
                        .ok_or_else(|| anyhow!("--method must be \"mean\" or \"median\""))?;
                    idx += 1;
                }
                "--equalize" => {
                    config.equalize = true;
                    idx += 1;
                }
                "--smooth" => {
                    config.smooth = true;
                    idx += 1;
                }
                "--flip-h" => {
                    config.flip_horizontal = true;
                    idx += 1;
                }
                "--flip-v" => {
                    config.flip_vertical = true;
                    idx += 1;
                }
                "--mode" => {
                    idx += 1;
                    config.mode = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--mode requires a value"))?
                        .clone();
                    idx += 1;
                }
                "--select" => {
                    idx += 1;
                    config.selector = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--select requires a value"))?
                        .clone();
                    idx += 1;
                }
                "--reference" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--reference requires a value"))?;
                    config.reference = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--mask" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--mask requires a value"))?;
                    config.mask = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--roi" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--roi requires a value"))?;
                    config.rois.push(parse_roi(value)?);
                    idx += 1;
                }
                "--diff-threshold" => {
                    idx += 1;
                    config.diff_threshold = parse_value(args, idx, "--diff-threshold")?;
                    idx += 1;
                }
                "--min-matches" => {
                    idx += 1;
                    config.min_matches = parse_value(args, idx, "--min-matches")?;
                    idx += 1;
                }
                "--output" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--output requires a value"))?;
                    config.output_dir = PathBuf::from(value);
                    idx += 1;
                }
                "--cycles" => {
                    idx += 1;
                    config.cycles = parse_value(args, idx, "--cycles")?;
                    idx += 1;
                }
                "--verbose" => {
                    config.verbose = true;
                    idx += 1;
                }
                arg => {
                    bail!("Unrecognised argument: {arg}\n\n{USAGE}");
                }
            }
        }

        if config.frames_per_capture == 0 {
            bail!("--frames must be at least 1");
        }
        if config.fps <= 0.0 {
            bail!("--fps must be positive");
        }
        if !(0.0..=1.0).contains(&config.diff_threshold) {
            bail!("--diff-threshold must lie in [0, 1]");
        }
        if config.cycles == 0 {
            bail!("--cycles must be at least 1");
        }
        if config.reference.is_none() {
            bail!("Missing reference image. Provide --reference <path>.\n\n{USAGE}");
        }

        Ok(config)
    }

    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            registration: RegistrationParams {
                min_matches: self.min_matches,
                ..RegistrationParams::default()
            },
            diff_threshold: self.diff_threshold,
            circle: CircleParams::default(),
            ..EngineParams::default()
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], idx: usize, flag: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    args.get(idx)
        .ok_or_else(|| anyhow!("{flag} requires a value"))?
        .parse::<T>()
        .with_context(|| format!("{flag} has an invalid value"))
}

/// Parse `name:x,y,w,h` into a named ROI.
fn parse_roi(value: &str) -> Result<(String, Roi)> {
    let (name, rect) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("--roi expects name:x,y,w,h, got {value:?}"))?;
    let fields: Vec<&str> = rect.split(',').collect();
    if fields.len() != 4 {
        bail!("--roi expects name:x,y,w,h, got {value:?}");
    }
    let mut parsed = [0u32; 4];
    for (slot, field) in parsed.iter_mut().zip(&fields) {
        *slot = field
            .trim()
            .parse::<u32>()
            .with_context(|| format!("--roi field {field:?} is not an integer"))?;
    }
    Ok((
        name.to_string(),
        Roi::new(parsed[0], parsed[1], parsed[2], parsed[3]),
    ))
}
