//! The external ffmpeg contract: duration probe, Opus encode, progress scan.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// One Opus frame per 60 ms.
pub const FRAME_DURATION: Duration = Duration::from_millis(60);
/// RTP timestamp step per frame: 48 kHz x 60 ms.
pub const TIME_INCREMENT: u32 = 2880;

const BITRATE: &str = "96k";

/// Probe the media length via the encoder's metadata pass.
///
/// `ffmpeg -i <path>` exits unsuccessfully (no output mapped) but prints
/// `Duration: HH:MM:SS.cc,` to stderr; that line is the contract.
pub async fn probe_duration(source: &Path) -> Result<Duration> {
    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(source)
        .stdin(Stdio::null())
        .output()
        .await?;

    let text = String::from_utf8_lossy(&output.stderr);
    parse_probe_duration(&text).ok_or_else(|| Error::CommandFailed {
        command: "ffmpeg -i",
        stderr: text.lines().last().unwrap_or_default().to_owned(),
    })
}

/// Start the encoder: Opus at 60 ms frames, VBR off, 96 kbps, seeked to
/// `position`, progress streamed on stderr. Realtime pacing (`-re`) is only
/// wanted when starting from the top.
pub fn spawn_encoder(source: &Path, position: Duration) -> Result<Child> {
    let mut command = Command::new("ffmpeg");
    command.arg("-hide_banner").arg("-loglevel").arg("error");
    if position.is_zero() {
        command.arg("-re");
    }
    command
        .arg("-threads")
        .arg("1")
        .arg("-i")
        .arg(source)
        .arg("-ss")
        .arg(format_time(position))
        .arg("-c:a")
        .arg("libopus")
        .arg("-b:a")
        .arg(BITRATE)
        .arg("-frame_duration")
        .arg("60")
        .arg("-vbr")
        .arg("off")
        .arg("-f")
        .arg("opus")
        .arg("-progress")
        .arg("pipe:2")
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    Ok(command.spawn()?)
}

/// Parse one `-progress` stream line. `out_time_ms` is microseconds despite
/// the name.
pub fn parse_out_time(line: &str) -> Option<Duration> {
    let value = line.strip_prefix("out_time_ms=")?.trim();
    let micros: i64 = value.parse().ok()?;
    u64::try_from(micros).ok().map(Duration::from_micros)
}

pub fn parse_probe_duration(output: &str) -> Option<Duration> {
    let rest = output.split("Duration: ").nth(1)?;
    let clock = rest.split([',', '\n']).next()?.trim();
    parse_clock(clock)
}

fn parse_clock(clock: &str) -> Option<Duration> {
    let mut parts = clock.split(':');
    let hours: u64 = parts.next()?.trim().parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds < 0.0 {
        return None;
    }

    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// Seek positions for `-ss`, in the narrowest `MM:SS`-and-up clock form.
pub fn format_time(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86400;
    let hours = total % 86400 / 3600;
    let minutes = total % 3600 / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days:02}:{hours:02}:{minutes:02}:{seconds:02}")
    } else if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn probe_output_yields_the_duration() {
        let output = "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'songs/youtube_abc.m4a':\n\
                      Duration: 00:03:25.46, start: 0.000000, bitrate: 130 kb/s\n";
        assert_eq!(
            parse_probe_duration(output),
            Some(Duration::from_secs(205) + Duration::from_millis(460))
        );
    }

    #[test]
    fn probe_without_a_duration_line_is_none() {
        assert_eq!(parse_probe_duration("songs/nope.m4a: No such file or directory\n"), None);
        assert_eq!(parse_probe_duration(""), None);
        assert_eq!(parse_probe_duration("Duration: N/A, bitrate: N/A\n"), None);
    }

    #[test]
    fn out_time_lines_are_microseconds() {
        assert_eq!(
            parse_out_time("out_time_ms=1500000"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_out_time("out_time_ms=0"), Some(Duration::ZERO));
        // other progress keys are ignored
        assert_eq!(parse_out_time("frame=123"), None);
        assert_eq!(parse_out_time("out_time=00:00:01.500000"), None);
        // ffmpeg emits a negative value before the first frame
        assert_eq!(parse_out_time("out_time_ms=-9223372036854775808"), None);
    }

    #[test]
    fn seek_times_use_the_narrowest_clock() {
        assert_eq!(format_time(Duration::ZERO), "00:00");
        assert_eq!(format_time(Duration::from_secs(65)), "01:05");
        assert_eq!(format_time(Duration::from_secs(3 * 3600 + 62)), "03:01:02");
        assert_eq!(
            format_time(Duration::from_secs(2 * 86400 + 3600 + 61)),
            "02:01:01:01"
        );
    }
}
