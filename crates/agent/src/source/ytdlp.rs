//! Resolve page URLs to direct media URLs with `yt-dlp`.

use super::SourceError;

/// Whether `stream_ref` is a page URL that needs resolving. Files, RTSP
/// and other schemes are handed to the decoder as-is.
pub fn needs_resolution(stream_ref: &str) -> bool {
    let lower = stream_ref.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// yt-dlp format selector for a resolution label.
///
/// `"720p"` becomes `best[height<=720]`; `"best"` and anything that is not
/// a `<height>p` label select the best single-file format.
pub fn format_selector(resolution: &str) -> String {
    resolution
        .strip_suffix('p')
        .and_then(|h| h.parse::<u32>().ok())
        .filter(|h| *h > 0)
        .map(|h| format!("best[height<={h}]"))
        .unwrap_or_else(|| "best".to_string())
}

/// Ask yt-dlp for the direct media URL of `page_url` at `resolution`.
pub async fn resolve(ytdlp_bin: &str, page_url: &str, resolution: &str) -> Result<String, SourceError> {
    let output = tokio::process::Command::new(ytdlp_bin)
        .args(["--no-playlist", "--no-warnings", "-f"])
        .arg(format_selector(resolution))
        .arg("-g")
        .arg(page_url)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SourceError::Resolve(format!("yt-dlp could not be started: {e}")))?;

    if !output.status.success() {
        return Err(SourceError::Resolve(format!(
            "yt-dlp exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    first_url(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| SourceError::Resolve(format!("yt-dlp returned no URL for {resolution}")))
}

/// First non-empty line of yt-dlp `-g` output. Merged formats print one
/// line per stream; the first is the video.
fn first_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
