//! Test catalog: the ordered set of manifest test cases.
//!
//! Cases come from the built-in HLS conformance list, from a JSON catalog
//! file, or are added ad hoc at run time. Catalog cases are identified by
//! their position; ad-hoc cases get negative indices (`-1`, `-2`, ...).

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Expected outcome of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expected {
    #[default]
    #[serde(alias = "PASS")]
    Pass,
    #[serde(alias = "FAIL")]
    Fail,
}

/// A single manifest test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Display name
    pub name: String,

    /// Absolute or relative URI of the HLS playlist
    #[serde(rename = "manifest")]
    pub manifest_uri: String,

    /// What the case exercises
    #[serde(default)]
    pub description: String,

    /// Absent in catalog files means the case must play
    #[serde(default)]
    pub expected: Expected,
}

impl TestCase {
    pub fn new(name: impl Into<String>, manifest_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manifest_uri: manifest_uri.into(),
            description: String::new(),
            expected: Expected::Pass,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn expect_failure(mut self) -> Self {
        self.expected = Expected::Fail;
        self
    }
}

/// Position of a case in the catalog; negative for ad-hoc cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestIndex(pub i64);

impl TestIndex {
    pub fn is_ad_hoc(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TestIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Error types for catalog operations
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid manifest URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("no test case at index {0}")]
    UnknownIndex(TestIndex),
}

/// Ordered registry of test cases.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    cases: Vec<Arc<TestCase>>,
    ad_hoc: Vec<Arc<TestCase>>,
    disabled: BTreeSet<TestIndex>,
}

impl Catalog {
    pub fn new(cases: Vec<TestCase>) -> Self {
        Self {
            cases: cases.into_iter().map(Arc::new).collect(),
            ad_hoc: Vec::new(),
            disabled: BTreeSet::new(),
        }
    }

    /// The built-in HLS conformance catalog.
    pub fn builtin() -> Self {
        Self::new(builtin_cases())
    }

    /// Parse a JSON array of `{name, manifest, description, expected?}` records.
    pub fn from_json_str(json: &str) -> CatalogResult<Self> {
        let cases: Vec<TestCase> = serde_json::from_str(json)?;
        Ok(Self::new(cases))
    }

    /// Load a JSON catalog file.
    pub fn load(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn get(&self, index: TestIndex) -> Option<&Arc<TestCase>> {
        if index.is_ad_hoc() {
            let slot = usize::try_from(-(index.0 + 1)).ok()?;
            self.ad_hoc.get(slot)
        } else {
            self.cases.get(usize::try_from(index.0).ok()?)
        }
    }

    pub fn require(&self, index: TestIndex) -> CatalogResult<&Arc<TestCase>> {
        self.get(index).ok_or(CatalogError::UnknownIndex(index))
    }

    /// Catalog cases in order, with their indices. Ad-hoc cases are not included.
    pub fn iter(&self) -> impl Iterator<Item = (TestIndex, &Arc<TestCase>)> {
        self.cases
            .iter()
            .enumerate()
            .map(|(i, case)| (TestIndex(i as i64), case))
    }

    /// Catalog cases that take part in a full run.
    pub fn enabled(&self) -> impl Iterator<Item = (TestIndex, &Arc<TestCase>)> {
        self.iter()
            .filter(move |(index, _)| !self.disabled.contains(index))
    }

    pub fn set_enabled(&mut self, index: TestIndex, enabled: bool) {
        if enabled {
            self.disabled.remove(&index);
        } else {
            self.disabled.insert(index);
        }
    }

    /// Register an ad-hoc case and return its synthesized negative index.
    pub fn add_ad_hoc(&mut self, case: TestCase) -> TestIndex {
        self.ad_hoc.push(Arc::new(case));
        TestIndex(-(self.ad_hoc.len() as i64))
    }
}

/// Build an ad-hoc case for a user-supplied manifest URI.
pub fn ad_hoc_from_uri(uri: &str) -> TestCase {
    TestCase::new(uri, uri).description("User-provided manifest")
}

/// Build an ad-hoc case for an uploaded manifest file.
pub fn ad_hoc_from_file(path: &Path) -> CatalogResult<TestCase> {
    let absolute = std::fs::canonicalize(path)?;
    let url = Url::from_file_path(&absolute).map_err(|_| CatalogError::InvalidUri {
        uri: absolute.display().to_string(),
        reason: "not an absolute file path".to_string(),
    })?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| url.to_string());
    Ok(TestCase::new(name, url.as_str()).description("Uploaded manifest"))
}

/// Resolve a catalog manifest URI, relative ones against `base`.
///
/// Absolute URIs are returned as-is.
pub fn resolve_manifest(uri: &str, base: &Url) -> CatalogResult<Url> {
    base.join(uri.trim()).map_err(|e| CatalogError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

fn case(name: &str, manifest: &str, description: &str) -> TestCase {
    TestCase::new(name, manifest).description(description)
}

fn builtin_cases() -> Vec<TestCase> {
    vec![
        case(
            "Basic VOD (TS)",
            "/manifests/basic-vod-ts.m3u8",
            "A standard Video-On-Demand presentation using MPEG-2 Transport Stream segments.",
        ),
        case(
            "Basic VOD (fMP4)",
            "/manifests/basic-vod-fmp4.m3u8",
            "A standard Video-On-Demand presentation using fragmented MP4 segments.",
        ),
        case(
            "Quirk: ENDLIST in Multivariant Playlist",
            "/manifests/quirk-endlist-in-multivariant.m3u8",
            "A multivariant playlist with a trailing EXT-X-ENDLIST tag, which is a spec violation.",
        ),
        case(
            "Quirk: Duplicate Rendition Names",
            "/manifests/quirk-duplicate-rendition-names.m3u8",
            "A manifest with multiple audio renditions in the same group using the same NAME attribute.",
        ),
        case(
            "Quirk: Multiple Default Renditions",
            "/manifests/quirk-multiple-default-renditions.m3u8",
            "A manifest with multiple audio renditions in the same group marked as DEFAULT=YES.",
        ),
        case(
            "Quirk: Missing EXTINF Comma",
            "/manifests/quirk-missing-extinf-comma.m3u8",
            "A media playlist where an EXTINF tag is missing its trailing comma.",
        ),
        case(
            "HEVC/H.265 VOD",
            "/manifests/vod-hevc.m3u8",
            "A VOD presentation using HEVC (H.265) codec.",
        ),
        case(
            "VP9 VOD",
            "/manifests/vod-vp9.m3u8",
            "A VOD presentation using VP9 codec in an MP4 container.",
        )
        .expect_failure(),
        case(
            "AV1 VOD",
            "/manifests/vod-av1.m3u8",
            "A VOD presentation using AV1 codec.",
        )
        .expect_failure(),
        case(
            "AES-128 Encrypted VOD",
            "/manifests/vod-aes128.m3u8",
            "A VOD presentation encrypted with AES-128.",
        ),
        case(
            "SAMPLE-AES Encrypted VOD",
            "/manifests/vod-sample-aes.m3u8",
            "A VOD presentation encrypted with SAMPLE-AES.",
        ),
        case(
            "Audio-Only VOD",
            "/manifests/vod-audio-only.m3u8",
            "A VOD presentation with only an audio track.",
        ),
        case(
            "Video-Only VOD",
            "/manifests/vod-video-only.m3u8",
            "A VOD presentation with only a video track.",
        ),
        case(
            "Alternate Audio Renditions",
            "/manifests/vod-alternate-audio.m3u8",
            "A VOD with multiple selectable audio tracks (e.g., different languages).",
        ),
        case(
            "Alternate Video Renditions (Bitrate)",
            "/manifests/vod-alternate-video.m3u8",
            "A multivariant playlist with multiple video renditions at different bitrates.",
        ),
        case(
            "I-Frame Stream",
            "/manifests/vod-iframe-stream.m3u8",
            "A VOD with an I-frame only stream for fast seeking.",
        ),
        case(
            "Subtitles (WebVTT)",
            "/manifests/vod-webvtt.m3u8",
            "A VOD with WebVTT subtitles.",
        ),
        case(
            "Discontinuity",
            "/manifests/vod-discontinuity.m3u8",
            "A VOD with a discontinuity tag between segments.",
        ),
        case(
            "BYTERANGE Support",
            "/manifests/vod-byterange.m3u8",
            "A VOD using BYTERANGE requests to seek within a single file.",
        ),
        case(
            "Invalid Segment URI",
            "/manifests/fail-invalid-segment-uri.m3u8",
            "A media playlist pointing to a segment that does not exist.",
        )
        .expect_failure(),
        case(
            "Mismatched Target Duration",
            "/manifests/fail-mismatched-target-duration.m3u8",
            "A media playlist where a segment duration exceeds the target duration.",
        )
        .expect_failure(),
        case(
            "Missing Endlist Tag (VOD)",
            "/manifests/fail-missing-endlist.m3u8",
            "A VOD playlist that is missing the EXT-X-ENDLIST tag.",
        )
        .expect_failure(),
        case(
            "Corrupted Segment",
            "/manifests/fail-corrupted-segment.m3u8",
            "A media playlist with a link to a corrupted media segment.",
        )
        .expect_failure(),
        case(
            "Unsupported Codec",
            "/manifests/fail-unsupported-codec.m3u8",
            "A manifest declaring a codec string that is not supported by the platform.",
        )
        .expect_failure(),
        case(
            "Cross-protocol Redirect",
            "/manifests/fail-cross-protocol-redirect.m3u8",
            "A manifest that redirects from HTTPS to HTTP.",
        )
        .expect_failure(),
    ]
}
