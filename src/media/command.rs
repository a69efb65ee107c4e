//! Media subprocess command lines
//!
//! The encoder turns a live capture source into a continuous byte stream on
//! stdout; the decoder renders a continuous byte stream fed to stdin. Both
//! default to the ffmpeg family but any program with the same pipe contract
//! works, which is what the tests use.

/// A program plus arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCommand {
    program: String,
    args: Vec<String>,
}

/// libx264 presets accepted by [`MediaCommand::encoder`].
pub const ENCODER_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

impl MediaCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Screen-capture encoder: PipeWire capture, low-latency H.264 in an
    /// MPEG-TS container on stdout.
    ///
    /// `keyframe_interval` is in frames, see
    /// [`StreamSettings::keyframe_interval`](crate::server::StreamSettings::keyframe_interval).
    pub fn encoder(
        width: u32,
        height: u32,
        fps: u32,
        crf: u32,
        preset: &str,
        keyframe_interval: u32,
    ) -> Self {
        let framerate = fps.to_string();
        let scale = format!("scale={}:{}", width, height);
        let crf = crf.to_string();
        let gop = keyframe_interval.to_string();

        Self::new(
            "ffmpeg",
            [
                "-loglevel",
                "error",
                "-f",
                "pipewire",
                "-framerate",
                framerate.as_str(),
                "-i",
                "portal",
                "-vf",
                scale.as_str(),
                "-c:v",
                "libx264",
                "-preset",
                preset,
                "-tune",
                "zerolatency",
                "-crf",
                crf.as_str(),
                "-g",
                gop.as_str(),
                "-pix_fmt",
                "yuv420p",
                "-f",
                "mpegts",
                "-",
            ],
        )
    }

    /// Low-latency player reading from stdin.
    pub fn decoder(window_title: &str) -> Self {
        Self::new(
            "ffplay",
            [
                "-loglevel",
                "error",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-probesize",
                "32",
                "-sync",
                "ext",
                "-window_title",
                window_title,
                "-",
            ],
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn build(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl std::fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
