use std::path::PathBuf;
use std::sync::Arc;

use crate::shared::error::{Result, VitalsError};
use crate::shared::frame::RawFrame;
use crate::shared::video_metadata::VideoMetadata;

use super::decode_options::DecodeOptions;

/// Where encoded media comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaSource {
    Bytes(Arc<[u8]>),
    Path(PathBuf),
    Url(String),
}

impl MediaSource {
    /// Rejects sources that cannot possibly be opened.
    pub fn validate(&self) -> Result<()> {
        match self {
            MediaSource::Bytes(bytes) if bytes.is_empty() => {
                Err(VitalsError::InvalidSource("byte source is empty".into()))
            }
            MediaSource::Path(path) if !path.is_file() => Err(VitalsError::InvalidSource(
                format!("file not found: {}", path.display()),
            )),
            MediaSource::Url(url) if url.trim().is_empty() => {
                Err(VitalsError::InvalidSource("URL is empty".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            MediaSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            MediaSource::Path(path) => path.display().to_string(),
            MediaSource::Url(url) => url.clone(),
        }
    }
}

impl From<PathBuf> for MediaSource {
    fn from(path: PathBuf) -> Self {
        MediaSource::Path(path)
    }
}

impl From<Vec<u8>> for MediaSource {
    fn from(bytes: Vec<u8>) -> Self {
        MediaSource::Bytes(bytes.into())
    }
}

pub type FrameIter = Box<dyn Iterator<Item = Result<RawFrame>> + Send>;

/// Probes and decodes encoded video.
///
/// Implementations hold no state between calls: every `decode` starts
/// from the beginning of the source and yields frames in index order.
pub trait VideoDecoder: Send + Sync {
    fn probe(&self, source: &MediaSource) -> Result<VideoMetadata>;

    /// Lazily decodes `source`, applying `options` to every frame.
    ///
    /// Isolated undecodable packets are skipped and logged. An `Err` item
    /// means decoding cannot continue and is the last item yielded.
    fn decode(
        &self,
        source: &MediaSource,
        options: &DecodeOptions,
        metadata: &VideoMetadata,
    ) -> Result<FrameIter>;
}
