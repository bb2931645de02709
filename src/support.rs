//! MIME type × codec support grids.
//!
//! Two grids are built from the same axes: one from the Media Source
//! Extensions check (`is_type_supported`, pass or fail) and one from the media
//! element's `can_play_type` answer (probably, maybe or no).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

/// Container and playlist MIME types probed by the grids
pub const MIME_TYPES: [&str; 8] = [
    "audio/aac",
    "video/mp4",
    "video/webm",
    "video/mp2t",
    "video/x-mpegURL",
    "video/vnd.apple.mpegurl",
    "application/x-mpegURL",
    "application/vnd.apple.mpegurl",
];

/// Codec strings probed by the grids
pub const CODEC_STRINGS: [&str; 24] = [
    // AAC and friends
    "mp4a.40",
    "mp4a.40.2",
    "mp4a.40.5",
    "mp4a.40.34",
    "ec-3",
    // H.264
    "avc1",
    "avc1.42001e",
    "avc1.66.30",
    "avc1.42c01e",
    "avc1.4d401e",
    "avc1.64001e",
    "avc1.42E01E",
    "avc1.42001f",
    "avc1.64001f",
    "avc1.77.30",
    "avc1.4d0028",
    "avc1.640028",
    "avc1.640029",
    // HEVC
    "hvc1.1.6.L93.B0",
    "hev1.1.6.L93.B0",
    "hev1.1.6.L150",
    "hvc1.1.60000000.L123.B0",
    // VP9
    "vp09.00.50.08",
    // AV1
    "av01.0.04M.08",
];

/// The type string handed to a probe
pub fn full_type(mime: &str, codec: &str) -> String {
    format!("{}; codecs=\"{}\"", mime, codec)
}

/// Result type for support operations
pub type SupportResult<T> = Result<T, SupportError>;

/// Error types for support operations
#[derive(Debug, Error)]
pub enum SupportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid support table: {0}")]
    Json(#[from] serde_json::Error),
}

/// Answer of a media element's `canPlayType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportLevel {
    Probably,
    Maybe,
    #[default]
    #[serde(alias = "")]
    No,
}

/// Classification shown in a grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportCell {
    Pass,
    Maybe,
    Fail,
}

impl SupportCell {
    fn symbol(&self) -> char {
        match self {
            SupportCell::Pass => '✓',
            SupportCell::Maybe => '?',
            SupportCell::Fail => '✗',
        }
    }
}

impl From<SupportLevel> for SupportCell {
    fn from(level: SupportLevel) -> Self {
        match level {
            SupportLevel::Probably => SupportCell::Pass,
            SupportLevel::Maybe => SupportCell::Maybe,
            SupportLevel::No => SupportCell::Fail,
        }
    }
}

impl From<bool> for SupportCell {
    fn from(supported: bool) -> Self {
        if supported {
            SupportCell::Pass
        } else {
            SupportCell::Fail
        }
    }
}

/// Something that can answer type support questions
pub trait TypeSupportProbe {
    /// Media element support for `full_type`
    fn can_play_type(&self, full_type: &str) -> SupportLevel;

    /// Media Source Extensions support for `full_type`
    fn is_type_supported(&self, full_type: &str) -> bool;
}

/// Probe backed by recorded answers. Unlisted types are unsupported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableProbe {
    #[serde(default)]
    pub can_play_type: HashMap<String, SupportLevel>,
    #[serde(default)]
    pub is_type_supported: HashMap<String, bool>,
}

impl TableProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> SupportResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> SupportResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_level(mut self, full_type: impl Into<String>, level: SupportLevel) -> Self {
        self.can_play_type.insert(full_type.into(), level);
        self
    }

    pub fn with_mse(mut self, full_type: impl Into<String>, supported: bool) -> Self {
        self.is_type_supported.insert(full_type.into(), supported);
        self
    }
}

impl TypeSupportProbe for TableProbe {
    fn can_play_type(&self, full_type: &str) -> SupportLevel {
        self.can_play_type.get(full_type).copied().unwrap_or_default()
    }

    fn is_type_supported(&self, full_type: &str) -> bool {
        self.is_type_supported.get(full_type).copied().unwrap_or(false)
    }
}

/// Which check a grid was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GridKind {
    MediaSource,
    MediaElement,
}

/// One row per MIME type, one cell per codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportGrid {
    pub kind: GridKind,
    pub x_axis: Vec<String>,
    pub y_axis: Vec<String>,
    pub cells: Vec<Vec<SupportCell>>,
}

impl SupportGrid {
    pub fn build(kind: GridKind, probe: &dyn TypeSupportProbe) -> Self {
        let cells = MIME_TYPES
            .iter()
            .map(|mime| {
                CODEC_STRINGS
                    .iter()
                    .map(|codec| {
                        let ty = full_type(mime, codec);
                        match kind {
                            GridKind::MediaSource => probe.is_type_supported(&ty).into(),
                            GridKind::MediaElement => probe.can_play_type(&ty).into(),
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            kind,
            x_axis: CODEC_STRINGS.iter().map(|s| s.to_string()).collect(),
            y_axis: MIME_TYPES.iter().map(|s| s.to_string()).collect(),
            cells,
        }
    }

    pub fn cell(&self, mime: &str, codec: &str) -> Option<SupportCell> {
        let y = self.y_axis.iter().position(|m| m == mime)?;
        let x = self.x_axis.iter().position(|c| c == codec)?;
        Some(self.cells[y][x])
    }

    /// Number of cells with each classification: (pass, maybe, fail)
    pub fn tally(&self) -> (usize, usize, usize) {
        self.cells.iter().flatten().fold((0, 0, 0), |(p, m, f), cell| match cell {
            SupportCell::Pass => (p + 1, m, f),
            SupportCell::Maybe => (p, m + 1, f),
            SupportCell::Fail => (p, m, f + 1),
        })
    }

    /// Text grid, codecs as rows so long MIME types stay readable
    pub fn render(&self) -> String {
        let codec_width = self.x_axis.iter().map(|c| c.len()).max().unwrap_or(0);
        let mut out = String::new();
        for (i, mime) in self.y_axis.iter().enumerate() {
            let _ = writeln!(out, "{:>w$}  [{}] {}", "", i, mime, w = codec_width);
        }
        for (x, codec) in self.x_axis.iter().enumerate() {
            let _ = write!(out, "{:>w$} ", codec, w = codec_width);
            for row in &self.cells {
                let _ = write!(out, " {}", row[x].symbol());
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_full_type() {
        assert_eq!(
            full_type("video/mp4", "avc1.42E01E"),
            "video/mp4; codecs=\"avc1.42E01E\""
        );
    }

    #[test]
    fn test_grids_classify_cells() {
        let probe = TableProbe::new()
            .with_level(full_type("video/mp4", "avc1.640028"), SupportLevel::Probably)
            .with_level(full_type("video/mp4", "avc1"), SupportLevel::Maybe)
            .with_mse(full_type("video/mp4", "avc1.640028"), true);

        let element = SupportGrid::build(GridKind::MediaElement, &probe);
        assert_eq!(element.cells.len(), MIME_TYPES.len());
        assert_eq!(element.cells[0].len(), CODEC_STRINGS.len());
        assert_eq!(element.cell("video/mp4", "avc1.640028"), Some(SupportCell::Pass));
        assert_eq!(element.cell("video/mp4", "avc1"), Some(SupportCell::Maybe));
        assert_eq!(element.cell("video/webm", "vp09.00.50.08"), Some(SupportCell::Fail));
        assert_eq!(element.tally(), (1, 1, 8 * 24 - 2));

        let mse = SupportGrid::build(GridKind::MediaSource, &probe);
        assert_eq!(mse.tally(), (1, 0, 8 * 24 - 1));
    }

    #[test]
    fn test_table_probe_from_json() {
        let probe = TableProbe::from_json_str(
            r#"{
                "canPlayType": {"video/mp4; codecs=\"avc1\"": "probably", "audio/aac; codecs=\"ec-3\"": ""},
                "isTypeSupported": {"video/mp4; codecs=\"avc1\"": true}
            }"#,
        )
        .unwrap();
        assert_eq!(probe.can_play_type("video/mp4; codecs=\"avc1\""), SupportLevel::Probably);
        assert_eq!(probe.can_play_type("audio/aac; codecs=\"ec-3\""), SupportLevel::No);
        assert!(probe.is_type_supported("video/mp4; codecs=\"avc1\""));
        assert!(TableProbe::from_json_str("[]").is_err());
    }

    #[test]
    fn test_render_has_a_row_per_codec() {
        let grid = SupportGrid::build(GridKind::MediaSource, &TableProbe::new());
        let text = grid.render();
        assert_eq!(text.lines().count(), MIME_TYPES.len() + CODEC_STRINGS.len());
    }
}
