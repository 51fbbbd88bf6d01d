
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sentinel meaning "unknown/not applicable" for integer-valued fields at
/// the wire boundary. Internally absence is `Option`.
pub const NO_VALUE: i32 = -1;

/// Sentinel subsample offset meaning timestamps are relative to the parent
/// sample's timestamp.
pub const OFFSET_SAMPLE_RELATIVE: i64 = i64::MAX;

pub const SELECTION_FLAG_DEFAULT: u32 = 1;
pub const SELECTION_FLAG_FORCED: u32 = 1 << 1;
pub const SELECTION_FLAG_AUTOSELECT: u32 = 1 << 2;

pub const ROLE_FLAG_MAIN: u32 = 1;
pub const ROLE_FLAG_ALTERNATE: u32 = 1 << 1;
pub const ROLE_FLAG_SUPPLEMENTARY: u32 = 1 << 2;
pub const ROLE_FLAG_COMMENTARY: u32 = 1 << 3;
pub const ROLE_FLAG_DUB: u32 = 1 << 4;
pub const ROLE_FLAG_EMERGENCY: u32 = 1 << 5;
pub const ROLE_FLAG_CAPTION: u32 = 1 << 6;
pub const ROLE_FLAG_SUBTITLE: u32 = 1 << 7;
pub const ROLE_FLAG_DESCRIBES_VIDEO: u32 = 1 << 8;

/// MIME types the pipeline cares about by name.
pub mod mime {
    pub const VIDEO_MP2T: &str = "video/mp2t";
    pub const VIDEO_H264: &str = "video/avc";
    pub const VIDEO_H265: &str = "video/hevc";
    pub const AUDIO_AAC: &str = "audio/mp4a-latm";
    pub const AUDIO_AC3: &str = "audio/ac3";
    pub const AUDIO_OPUS: &str = "audio/opus";
    pub const APPLICATION_ID3: &str = "application/id3";
}

lazy_static! {
    /// RFC 6381 codec prefix to track type. Keyed on the identifier before
    /// the first '.' of a codec string, lower case.
    static ref CODEC_TRACK_TYPES: HashMap<&'static str, TrackType> = {
        let mut m = HashMap::new();
        for video in ["avc1", "avc3", "hvc1", "hev1", "vp08", "vp09", "av01", "mp4v", "h263"] {
            m.insert(video, TrackType::Video);
        }
        for audio in [
            "mp4a", "opus", "vorbis", "flac", "alac", "ac-3", "ec-3", "ac-4", "dtsc", "dtse",
            "mha1", "mhm1",
        ] {
            m.insert(audio, TrackType::Audio);
        }
        for text in ["stpp", "wvtt", "tx3g"] {
            m.insert(text, TrackType::Text);
        }
        m
    };
}

/// The broad category of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Unknown,
    Audio,
    Video,
    Text,
    Metadata,
}

impl Default for TrackType {
    fn default() -> Self {
        TrackType::Unknown
    }
}

impl TrackType {
    /// Derives the track type from a MIME type string.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim();
        if mime.starts_with("audio/") {
            TrackType::Audio
        } else if mime.starts_with("video/") {
            TrackType::Video
        } else if mime.starts_with("text/") || mime == "application/x-subrip" {
            TrackType::Text
        } else if mime == "application/id3" || mime == "application/x-emsg" {
            TrackType::Metadata
        } else {
            TrackType::Unknown
        }
    }

    /// Derives the track type from a single RFC 6381 codec identifier.
    pub fn of_codec(codec: &str) -> Self {
        let prefix = codec
            .trim()
            .split('.')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        CODEC_TRACK_TYPES
            .get(prefix.as_str())
            .copied()
            .unwrap_or(TrackType::Unknown)
    }
}

/// Normalizes a language tag towards IETF BCP-47: lower case, '-' separated,
/// with the "undetermined" tag mapped to absence.
pub fn normalize_language(language: &str) -> Option<String> {
    let normalized = language.trim().replace('_', "-").to_ascii_lowercase();
    if normalized.is_empty() || normalized == "und" {
        None
    } else {
        Some(normalized)
    }
}

/// Ordered sidecar of opaque metadata entries carried alongside a format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub entries: Vec<Bytes>,
}

impl Metadata {
    pub fn new(entries: Vec<Bytes>) -> Self {
        Metadata { entries }
    }

    /// Returns a copy of `self` with `other`'s entries appended.
    pub fn with_appended(&self, other: &Metadata) -> Metadata {
        let mut entries = self.entries.clone();
        entries.extend(other.entries.iter().cloned());
        Metadata { entries }
    }
}

/// Initialization data for one DRM scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeData {
    /// 16-byte scheme UUID.
    pub scheme: [u8; 16],
    pub mime: Option<String>,
    pub data: Bytes,
}

/// DRM initialization data, a set of per-scheme blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrmInitData {
    pub scheme_type: Option<String>,
    pub scheme_data: Vec<SchemeData>,
}

impl DrmInitData {
    /// Session-creation-data merge: `manifest` entries first, then `media`,
    /// deduplicated by scheme UUID (first occurrence wins).
    pub fn merge(manifest: Option<&DrmInitData>, media: Option<&DrmInitData>) -> Option<DrmInitData> {
        match (manifest, media) {
            (None, None) => None,
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (Some(manifest), Some(media)) => {
                let mut scheme_data: Vec<SchemeData> = Vec::new();
                for sd in manifest.scheme_data.iter().chain(media.scheme_data.iter()) {
                    if !scheme_data.iter().any(|existing| existing.scheme == sd.scheme) {
                        scheme_data.push(sd.clone());
                    }
                }
                Some(DrmInitData {
                    scheme_type: media
                        .scheme_type
                        .clone()
                        .or_else(|| manifest.scheme_type.clone()),
                    scheme_data,
                })
            }
        }
    }
}

/// Encryption scheme tag for protected samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CryptoType {
    Cenc,
    Cbcs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StereoMode {
    MonoLeft,
    MonoRight,
    TopBottom,
    LeftRight,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorInfo {
    pub color_space: Option<u32>,
    pub color_range: Option<u32>,
    pub color_transfer: Option<u32>,
    pub hdr_static_info: Option<Bytes>,
}

/// Timestamp base for subsamples carried inside a parent sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsampleOffset {
    /// Subsample timestamps are relative to the parent sample's timestamp.
    SampleRelative,
    /// Subsample timestamps are offset by a fixed amount, in microseconds.
    Fixed(i64),
}

impl Default for SubsampleOffset {
    fn default() -> Self {
        SubsampleOffset::Fixed(0)
    }
}

impl SubsampleOffset {
    /// Converts the wire sentinel representation.
    pub fn from_us(offset_us: i64) -> Self {
        if offset_us == OFFSET_SAMPLE_RELATIVE {
            SubsampleOffset::SampleRelative
        } else {
            SubsampleOffset::Fixed(offset_us)
        }
    }

    /// Converts back to the wire sentinel representation.
    pub fn to_us(self) -> i64 {
        match self {
            SubsampleOffset::SampleRelative => OFFSET_SAMPLE_RELATIVE,
            SubsampleOffset::Fixed(us) => us,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f32>,
    /// Clockwise rotation to apply before display, one of 0, 90, 180, 270.
    pub rotation_degrees: u32,
    pub pixel_aspect_ratio: f32,
    pub projection_data: Option<Bytes>,
    pub stereo_mode: Option<StereoMode>,
    pub color_info: Option<ColorInfo>,
}

impl Default for VideoInfo {
    fn default() -> Self {
        VideoInfo {
            width: None,
            height: None,
            frame_rate: None,
            rotation_degrees: 0,
            pixel_aspect_ratio: 1.0,
            projection_data: None,
            stereo_mode: None,
            color_info: None,
        }
    }
}

impl PartialEq for VideoInfo {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.frame_rate.map(f32::to_bits) == other.frame_rate.map(f32::to_bits)
            && self.rotation_degrees == other.rotation_degrees
            && self.pixel_aspect_ratio.to_bits() == other.pixel_aspect_ratio.to_bits()
            && self.projection_data == other.projection_data
            && self.stereo_mode == other.stereo_mode
            && self.color_info == other.color_info
    }
}

impl Eq for VideoInfo {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioInfo {
    pub channel_count: Option<u32>,
    pub sample_rate: Option<u32>,
    pub pcm_encoding: Option<u32>,
    /// Leading samples the decoder should trim.
    pub encoder_delay: u32,
    /// Trailing samples the decoder should trim.
    pub encoder_padding: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextInfo {
    pub accessibility_channel: Option<u32>,
}

/// Category-specific half of a format descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatDetails {
    None,
    Video(VideoInfo),
    Audio(AudioInfo),
    Text(TextInfo),
}

impl Default for FormatDetails {
    fn default() -> Self {
        FormatDetails::None
    }
}

/// Immutable description of one media elementary stream.
///
/// `Format` is value-equal: equality compares every field, byte fields by
/// content. The hash is lazily memoized and deliberately excludes
/// `init_data`, DRM data, projection bytes and color info, which are
/// expensive to hash and rarely discriminating.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Format {
    pub id: Option<String>,
    pub label: Option<String>,
    /// IETF BCP-47 normalized, see [`normalize_language`].
    pub language: Option<String>,
    pub selection_flags: u32,
    pub role_flags: u32,

    pub average_bitrate: Option<u32>,
    pub peak_bitrate: Option<u32>,

    /// RFC 6381 codecs string.
    pub codecs: Option<String>,
    pub container_mime: Option<String>,
    pub sample_mime: Option<String>,
    pub metadata: Option<Metadata>,
    /// Ordered initialization blobs (e.g. codec specific data).
    pub init_data: Vec<Bytes>,

    pub drm_init_data: Option<DrmInitData>,
    pub crypto_type: Option<CryptoType>,

    pub subsample_offset: SubsampleOffset,
    pub details: FormatDetails,

    #[serde(skip, default)]
    hash_memo: AtomicU64,
}

impl Clone for Format {
    fn clone(&self) -> Self {
        Format {
            id: self.id.clone(),
            label: self.label.clone(),
            language: self.language.clone(),
            selection_flags: self.selection_flags,
            role_flags: self.role_flags,
            average_bitrate: self.average_bitrate,
            peak_bitrate: self.peak_bitrate,
            codecs: self.codecs.clone(),
            container_mime: self.container_mime.clone(),
            sample_mime: self.sample_mime.clone(),
            metadata: self.metadata.clone(),
            init_data: self.init_data.clone(),
            drm_init_data: self.drm_init_data.clone(),
            crypto_type: self.crypto_type,
            subsample_offset: self.subsample_offset,
            details: self.details.clone(),
            hash_memo: AtomicU64::new(self.hash_memo.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for Format {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.label == other.label
            && self.language == other.language
            && self.selection_flags == other.selection_flags
            && self.role_flags == other.role_flags
            && self.average_bitrate == other.average_bitrate
            && self.peak_bitrate == other.peak_bitrate
            && self.codecs == other.codecs
            && self.container_mime == other.container_mime
            && self.sample_mime == other.sample_mime
            && self.metadata == other.metadata
            && self.init_data == other.init_data
            && self.drm_init_data == other.drm_init_data
            && self.crypto_type == other.crypto_type
            && self.subsample_offset == other.subsample_offset
            && self.details == other.details
    }
}

impl Eq for Format {}

impl Hash for Format {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash());
    }
}

impl Format {
    /// Derived bitrate: peak when known, otherwise average.
    pub fn bitrate(&self) -> Option<u32> {
        self.peak_bitrate.or(self.average_bitrate)
    }

    /// The track type, derived from the sample MIME when present, else from
    /// the details variant.
    pub fn track_type(&self) -> TrackType {
        if let Some(mime) = &self.sample_mime {
            let t = TrackType::from_mime(mime);
            if t != TrackType::Unknown {
                return t;
            }
        }
        match &self.details {
            FormatDetails::Video(_) => TrackType::Video,
            FormatDetails::Audio(_) => TrackType::Audio,
            FormatDetails::Text(_) => TrackType::Text,
            FormatDetails::None => TrackType::Unknown,
        }
    }

    fn cached_hash(&self) -> u64 {
        let memo = self.hash_memo.load(Ordering::Relaxed);
        if memo != 0 {
            return memo;
        }
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.label.hash(&mut hasher);
        self.language.hash(&mut hasher);
        self.selection_flags.hash(&mut hasher);
        self.role_flags.hash(&mut hasher);
        self.average_bitrate.hash(&mut hasher);
        self.peak_bitrate.hash(&mut hasher);
        self.codecs.hash(&mut hasher);
        self.container_mime.hash(&mut hasher);
        self.sample_mime.hash(&mut hasher);
        self.metadata.hash(&mut hasher);
        self.crypto_type.hash(&mut hasher);
        self.subsample_offset.hash(&mut hasher);
        match &self.details {
            FormatDetails::None => 0u8.hash(&mut hasher),
            FormatDetails::Video(v) => {
                1u8.hash(&mut hasher);
                v.width.hash(&mut hasher);
                v.height.hash(&mut hasher);
                v.frame_rate.map(f32::to_bits).hash(&mut hasher);
                v.rotation_degrees.hash(&mut hasher);
                v.pixel_aspect_ratio.to_bits().hash(&mut hasher);
                v.stereo_mode.hash(&mut hasher);
            }
            FormatDetails::Audio(a) => {
                2u8.hash(&mut hasher);
                a.hash(&mut hasher);
            }
            FormatDetails::Text(t) => {
                3u8.hash(&mut hasher);
                t.hash(&mut hasher);
            }
        }
        let mut h = hasher.finish();
        if h == 0 {
            h = 1;
        }
        self.hash_memo.store(h, Ordering::Relaxed);
        h
    }

    /// Combines this sample-level descriptor with container-level hints.
    ///
    /// Passed values replace the corresponding fields; passed metadata is
    /// appended to the existing metadata; `bitrate` replaces both the
    /// average and the peak.
    #[allow(clippy::too_many_arguments)]
    pub fn with_container_info(
        &self,
        id: Option<&str>,
        label: Option<&str>,
        sample_mime: Option<&str>,
        codecs: Option<&str>,
        metadata: Option<&Metadata>,
        bitrate: Option<u32>,
        width: Option<u32>,
        height: Option<u32>,
        channel_count: Option<u32>,
        selection_flags: Option<u32>,
        language: Option<&str>,
    ) -> Format {
        let mut merged = self.clone();
        merged.hash_memo = AtomicU64::new(0);
        if id.is_some() {
            merged.id = id.map(str::to_owned);
        }
        if label.is_some() {
            merged.label = label.map(str::to_owned);
        }
        if sample_mime.is_some() {
            merged.sample_mime = sample_mime.map(str::to_owned);
        }
        if codecs.is_some() {
            merged.codecs = codecs.map(str::to_owned);
        }
        merged.metadata = match (&self.metadata, metadata) {
            (Some(own), Some(passed)) => Some(own.with_appended(passed)),
            (None, Some(passed)) => Some(passed.clone()),
            (own, None) => own.clone(),
        };
        if bitrate.is_some() {
            merged.average_bitrate = bitrate;
            merged.peak_bitrate = bitrate;
        }
        if let Some(flags) = selection_flags {
            merged.selection_flags = flags;
        }
        if let Some(language) = language {
            merged.language = normalize_language(language);
        }
        if width.is_some() || height.is_some() {
            let mut video = match &merged.details {
                FormatDetails::Video(v) => v.clone(),
                _ => VideoInfo::default(),
            };
            if width.is_some() {
                video.width = width;
            }
            if height.is_some() {
                video.height = height;
            }
            merged.details = FormatDetails::Video(video);
        }
        if channel_count.is_some() {
            let mut audio = match &merged.details {
                FormatDetails::Audio(a) => a.clone(),
                _ => AudioInfo::default(),
            };
            audio.channel_count = channel_count;
            merged.details = FormatDetails::Audio(audio);
        }
        merged
    }

    /// Combines this sample-level descriptor with the corresponding
    /// manifest-level descriptor, field by field:
    ///
    /// - id comes from the manifest; label prefers the manifest;
    /// - language prefers the sample, falling back to the manifest for
    ///   text and audio tracks;
    /// - bitrates and codecs prefer the sample; when the sample has no
    ///   codecs, the manifest codecs are filtered to those matching the
    ///   sample MIME's track type and adopted only if exactly one survives;
    /// - frame rate prefers the sample unless the track is video and the
    ///   sample value is absent;
    /// - selection and role flags are OR'd;
    /// - DRM init data merges manifest first, then sample.
    pub fn with_manifest_format(&self, manifest: &Format) -> Format {
        let mut merged = self.clone();
        merged.hash_memo = AtomicU64::new(0);
        let track_type = self.track_type();

        merged.id = manifest.id.clone();
        merged.label = manifest.label.clone().or_else(|| self.label.clone());
        if merged.language.is_none()
            && (track_type == TrackType::Text || track_type == TrackType::Audio)
        {
            merged.language = manifest.language.clone();
        }
        merged.average_bitrate = self.average_bitrate.or(manifest.average_bitrate);
        merged.peak_bitrate = self.peak_bitrate.or(manifest.peak_bitrate);
        if merged.codecs.is_none() {
            if let Some(manifest_codecs) = &manifest.codecs {
                merged.codecs = single_codec_of_type(manifest_codecs, track_type);
            }
        }
        if track_type == TrackType::Video {
            if let (FormatDetails::Video(own), FormatDetails::Video(manifest_video)) =
                (&mut merged.details, &manifest.details)
            {
                if own.frame_rate.is_none() {
                    own.frame_rate = manifest_video.frame_rate;
                }
            }
        }
        merged.selection_flags = self.selection_flags | manifest.selection_flags;
        merged.role_flags = self.role_flags | manifest.role_flags;
        merged.drm_init_data =
            DrmInitData::merge(manifest.drm_init_data.as_ref(), self.drm_init_data.as_ref());
        merged
    }
}

/// Filters `codecs` down to the identifiers whose track type matches
/// `track_type`, returning the survivor only when it is unique.
fn single_codec_of_type(codecs: &str, track_type: TrackType) -> Option<String> {
    let mut matching = codecs
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty() && TrackType::of_codec(c) == track_type);
    match (matching.next(), matching.next()) {
        (Some(only), None) => Some(only.to_owned()),
        _ => None,
    }
}
