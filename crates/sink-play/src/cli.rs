use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "sink-play", version, about = "Play a local file through the audio sink")]
pub struct Args {
    /// Path to audio file
    #[arg(required_unless_present = "list_devices")]
    pub path: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Playback speed (1.0 = normal)
    #[arg(long)]
    pub speed: Option<f32>,

    /// Playback pitch (1.0 = normal)
    #[arg(long)]
    pub pitch: Option<f32>,

    /// Shorten long silences
    #[arg(long)]
    pub skip_silence: bool,

    /// Output high-resolution sources as 32-bit float
    #[arg(long)]
    pub float_output: bool,

    /// Device buffer size in bytes (0 = derive from the format)
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// TOML settings file; command-line flags take precedence
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_required_unless_listing() {
        assert!(Args::try_parse_from(["sink-play"]).is_err());
        let args = Args::try_parse_from(["sink-play", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.path.is_none());
    }

    #[test]
    fn parses_playback_flags() {
        let args = Args::try_parse_from([
            "sink-play",
            "--speed",
            "1.5",
            "--skip-silence",
            "--buffer-size",
            "65536",
            "song.flac",
        ])
        .unwrap();
        assert_eq!(args.speed, Some(1.5));
        assert!(args.skip_silence);
        assert!(!args.float_output);
        assert_eq!(args.buffer_size, Some(65_536));
        assert_eq!(args.path, Some(PathBuf::from("song.flac")));
    }
}
