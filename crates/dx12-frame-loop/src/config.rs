use std::time::Duration;

use crate::backend::ClearColor;
use crate::error::ConfigError;

/// Largest swap chain DXGI accepts.
pub const MAX_BUFFER_COUNT: u32 = 16;

/// When the CPU blocks on the fence at the end of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FramePacing {
    /// Wait only for the slot about to be reused, keeping up to
    /// `buffer_count` frames in flight.
    #[default]
    PerSlot,
    /// Wait for the frame just submitted; CPU and GPU never overlap.
    Serialized,
}

/// Bounds on a blocking fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererConfig {
    pub buffer_count: u32,
    pub vsync: bool,
    pub pacing: FramePacing,
    pub wait_policy: WaitPolicy,
    pub clear_color: ClearColor,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            vsync: true,
            pacing: FramePacing::default(),
            wait_policy: WaitPolicy::default(),
            clear_color: ClearColor::default(),
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(ConfigError::BufferCount(self.buffer_count));
        }
        Ok(())
    }
}

/// Options taken from the process arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    pub use_warp_device: bool,
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames. Headless runs default to 3.
    pub frames: Option<u64>,
    pub renderer: RendererConfig,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            use_warp_device: false,
            width: 1280,
            height: 720,
            frames: None,
            renderer: RendererConfig::default(),
        }
    }
}

/// Builds [`LaunchOptions`] from the process arguments.
pub fn build_command_line() -> Result<LaunchOptions, ConfigError> {
    parse_args(std::env::args().skip(1))
}

/// Flags may start with `-` or `/` and are matched case-insensitively.
/// Unknown arguments are ignored.
pub fn parse_args<I, S>(args: I) -> Result<LaunchOptions, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut options = LaunchOptions::default();
    let mut args = args.into_iter().map(Into::into);

    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix('-').or_else(|| arg.strip_prefix('/')) else {
            continue;
        };
        match flag.to_ascii_lowercase().as_str() {
            "warp" => options.use_warp_device = true,
            "novsync" => options.renderer.vsync = false,
            "serialized" => options.renderer.pacing = FramePacing::Serialized,
            "buffers" => options.renderer.buffer_count = value(&arg, args.next())?,
            "width" => options.width = value(&arg, args.next())?,
            "height" => options.height = value(&arg, args.next())?,
            "frames" => options.frames = Some(value(&arg, args.next())?),
            _ => {}
        }
    }

    options.renderer.validate()?;
    if options.width == 0 || options.height == 0 {
        return Err(ConfigError::Extent {
            width: options.width,
            height: options.height,
        });
    }
    Ok(options)
}

fn value<T: std::str::FromStr>(flag: &str, raw: Option<String>) -> Result<T, ConfigError> {
    let raw = raw.ok_or_else(|| ConfigError::MissingValue(flag.to_owned()))?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_owned(),
        value: raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_setup() {
        let options = parse_args(Vec::<String>::new()).unwrap();
        assert_eq!((options.width, options.height), (1280, 720));
        assert_eq!(options.renderer.buffer_count, 3);
        assert!(options.renderer.vsync);
        assert_eq!(options.renderer.pacing, FramePacing::PerSlot);
        assert_eq!(options.renderer.wait_policy.timeout, Duration::from_millis(2000));
        assert_eq!(options.renderer.wait_policy.max_attempts, 3);
    }

    #[test]
    fn parses_flags_with_either_prefix() {
        let options = parse_args([
            "/WARP", "-novsync", "-Serialized", "-buffers", "2", "/width", "800", "-height",
            "600", "-frames", "10",
        ])
        .unwrap();
        assert!(options.use_warp_device);
        assert!(!options.renderer.vsync);
        assert_eq!(options.renderer.pacing, FramePacing::Serialized);
        assert_eq!(options.renderer.buffer_count, 2);
        assert_eq!((options.width, options.height), (800, 600));
        assert_eq!(options.frames, Some(10));
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            parse_args(["-buffers"]),
            Err(ConfigError::MissingValue("-buffers".into()))
        );
        assert_eq!(
            parse_args(["-width", "wide"]),
            Err(ConfigError::InvalidValue {
                flag: "-width".into(),
                value: "wide".into()
            })
        );
        assert_eq!(parse_args(["-buffers", "1"]), Err(ConfigError::BufferCount(1)));
        assert_eq!(parse_args(["-buffers", "17"]), Err(ConfigError::BufferCount(17)));
        assert_eq!(
            parse_args(["-height", "0"]),
            Err(ConfigError::Extent {
                width: 1280,
                height: 0
            })
        );
    }

    #[test]
    fn ignores_unknown_arguments() {
        let options = parse_args(["program", "--verbose", "-fullscreen"]).unwrap();
        assert_eq!(options, LaunchOptions::default());
    }
}
