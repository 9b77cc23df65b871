//! Video metadata as returned to HTTP clients, plus the subset of yt-dlp's
//! `--dump-single-json` payload it is built from.
//!
//! Everything on the raw side is optional: yt-dlp omits or nulls fields
//! freely depending on the site and the video.

use serde::{Deserialize, Serialize};

/// Marker used when the extractor did not report a byte count.
pub const UNKNOWN_SIZE: &str = "Unknown";
/// Resolution label for formats that carry no picture.
pub const AUDIO_RESOLUTION: &str = "audio";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Minimal view of yt-dlp's info JSON.
#[derive(Debug, Default, Deserialize)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub duration_string: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub height: Option<u64>,
    pub filesize: Option<f64>,
    pub format_note: Option<String>,
}

/// One downloadable variant of a video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatEntry {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub filesize: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// Simplified listing served by `/get_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub thumbnail: String,
    pub duration: String,
    pub uploader: String,
    pub view_count: u64,
    pub formats: Vec<FormatEntry>,
}

impl VideoMetadata {
    pub fn from_raw(raw: RawVideoInfo) -> Self {
        let duration = raw
            .duration_string
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                raw.duration
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(|secs| format_duration(secs.round() as u64))
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let formats = raw
            .formats
            .unwrap_or_default()
            .into_iter()
            .filter_map(FormatEntry::from_raw)
            .collect();

        Self {
            title: raw.title.unwrap_or_default(),
            thumbnail: raw.thumbnail.unwrap_or_default(),
            duration,
            uploader: raw.uploader.unwrap_or_default(),
            view_count: raw.view_count.unwrap_or(0),
            formats,
        }
    }

    /// Container extension of `format_id`, if the listing has it.
    pub fn extension_for(&self, format_id: &str) -> Option<&str> {
        self.formats
            .iter()
            .find(|format| format.format_id == format_id)
            .map(|format| format.ext.as_str())
    }
}

impl FormatEntry {
    /// Drops entries that lack an identifier or extension; they cannot be
    /// requested or named.
    fn from_raw(raw: RawFormat) -> Option<Self> {
        let format_id = non_empty(raw.format_id)?;
        let ext = non_empty(raw.ext)?;
        let resolution = non_empty(raw.resolution)
            .or_else(|| raw.height.map(|height| format!("{height}p")))
            .unwrap_or_else(|| AUDIO_RESOLUTION.to_string());

        Some(Self {
            format_id,
            ext,
            resolution,
            filesize: format_size(raw.filesize),
            note: raw.format_note.unwrap_or_default(),
        })
    }
}

/// `45.30 MB` style label, or [`UNKNOWN_SIZE`].
pub fn format_size(bytes: Option<f64>) -> String {
    match bytes {
        Some(bytes) if bytes.is_finite() && bytes >= 0.0 => {
            format!("{:.2} MB", bytes / BYTES_PER_MB)
        }
        _ => UNKNOWN_SIZE.to_string(),
    }
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips.
pub fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_raw() -> RawVideoInfo {
        serde_json::from_value(json!({
            "title": "Sample",
            "thumbnail": "https://i.example/thumb.jpg",
            "duration": 754.0,
            "duration_string": "12:34",
            "uploader": "Someone",
            "view_count": 1234,
            "formats": [
                {"format_id": "22", "ext": "mp4", "resolution": "720p", "filesize": 47500000},
                {"format_id": "140", "ext": "m4a", "resolution": "audio only", "filesize": null,
                 "format_note": "medium"},
                {"format_id": "18", "ext": "mp4", "height": 360},
                {"format_id": "251", "ext": "webm"},
                {"format_id": "", "ext": "mp4"},
                {"format_id": "sb0"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn size_is_megabytes_with_two_decimals() {
        assert_eq!(format_size(Some(47_500_000.0)), "45.30 MB");
        assert_eq!(format_size(Some(0.0)), "0.00 MB");
        assert_eq!(format_size(None), UNKNOWN_SIZE);
        assert_eq!(format_size(Some(f64::NAN)), UNKNOWN_SIZE);
    }

    #[test]
    fn duration_formats_hours_and_minutes() {
        assert_eq!(format_duration(59), "0:59");
        assert_eq!(format_duration(754), "12:34");
        assert_eq!(format_duration(3723), "1:02:03");
    }

    #[test]
    fn from_raw_reshapes_listing() {
        let info = VideoMetadata::from_raw(sample_raw());
        assert_eq!(info.title, "Sample");
        assert_eq!(info.duration, "12:34");
        assert_eq!(info.uploader, "Someone");
        assert_eq!(info.view_count, 1234);

        let ids: Vec<_> = info.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, ["22", "140", "18", "251"]);

        assert_eq!(
            info.formats[0],
            FormatEntry {
                format_id: "22".into(),
                ext: "mp4".into(),
                resolution: "720p".into(),
                filesize: "45.30 MB".into(),
                note: String::new(),
            }
        );
        assert_eq!(info.formats[1].filesize, UNKNOWN_SIZE);
        assert_eq!(info.formats[1].note, "medium");
        assert_eq!(info.formats[2].resolution, "360p");
        assert_eq!(info.formats[3].resolution, AUDIO_RESOLUTION);
    }

    #[test]
    fn every_format_has_required_fields() {
        let info = VideoMetadata::from_raw(sample_raw());
        for format in &info.formats {
            assert!(!format.format_id.is_empty());
            assert!(!format.ext.is_empty());
            assert!(!format.resolution.is_empty());
            assert!(format.filesize == UNKNOWN_SIZE || format.filesize.ends_with(" MB"));
        }
    }

    #[test]
    fn duration_falls_back_to_seconds() {
        let raw = RawVideoInfo {
            duration: Some(61.4),
            ..RawVideoInfo::default()
        };
        assert_eq!(VideoMetadata::from_raw(raw).duration, "1:01");
        assert_eq!(
            VideoMetadata::from_raw(RawVideoInfo::default()).duration,
            "Unknown"
        );
    }

    #[test]
    fn null_formats_yield_empty_listing() {
        let raw: RawVideoInfo =
            serde_json::from_value(json!({"title": "x", "formats": null})).unwrap();
        assert!(VideoMetadata::from_raw(raw).formats.is_empty());

        let raw: RawVideoInfo = serde_json::from_value(json!({"title": "x"})).unwrap();
        assert!(raw.formats.is_none());
        assert!(VideoMetadata::from_raw(raw).formats.is_empty());
    }

    #[test]
    fn extension_lookup_matches_format_id() {
        let info = VideoMetadata::from_raw(sample_raw());
        assert_eq!(info.extension_for("251"), Some("webm"));
        assert_eq!(info.extension_for("999"), None);
    }

    #[test]
    fn note_is_omitted_when_empty() {
        let info = VideoMetadata::from_raw(sample_raw());
        let value = serde_json::to_value(&info.formats[0]).unwrap();
        assert!(value.get("note").is_none());
        assert_eq!(value["filesize"], "45.30 MB");
    }
}
