mod error;
pub mod filename;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use image::codecs::avif::AvifEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageReader};
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::config::TranscodeSection;
use crate::format::TargetFormat;

pub use error::{TranscodeError, TranscodeResult};

pub const OUTPUT_STEM: &str = "converted";

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeOutput {
    pub result_location: PathBuf,
    pub original_filename: Option<String>,
}

/// Produces the cached artifact for one task.
///
/// Implementations download, convert and store; they never retry. The worker
/// records whatever they return as the task's terminal state.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        source_url: &str,
        format: TargetFormat,
        task_id: i64,
    ) -> TranscodeResult<TranscodeOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    pub webp_quality: u8,
    pub webp_method: u8,
    pub avif_quality: u8,
    pub avif_speed: u8,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            webp_quality: 80,
            webp_method: 4,
            avif_quality: 65,
            avif_speed: 6,
        }
    }
}

impl From<&TranscodeSection> for EncodeSettings {
    fn from(section: &TranscodeSection) -> Self {
        Self {
            webp_quality: section.webp_quality,
            webp_method: section.webp_method,
            avif_quality: section.avif_quality,
            avif_speed: section.avif_speed,
        }
    }
}

struct DownloadedSource {
    file: tempfile::NamedTempFile,
    original_filename: String,
}

/// Default executor: fetches the source over HTTP(S) (or `file://`), decodes
/// it with `image` and re-encodes to the requested format under
/// `<storage_dir>/<task_id>/converted.<ext>`.
#[derive(Clone)]
pub struct ImageTranscoder {
    http_client: Client,
    storage_dir: PathBuf,
    settings: Arc<EncodeSettings>,
}

impl ImageTranscoder {
    pub fn new(storage_dir: impl Into<PathBuf>, section: &TranscodeSection) -> TranscodeResult<Self> {
        let http_client = Client::builder()
            .user_agent(section.user_agent.clone())
            .build()
            .map_err(|err| TranscodeError::Network(err.to_string()))?;
        Ok(Self {
            http_client,
            storage_dir: storage_dir.into(),
            settings: Arc::new(EncodeSettings::from(section)),
        })
    }

    pub fn with_settings(mut self, settings: EncodeSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn output_path(&self, task_id: i64, format: TargetFormat) -> PathBuf {
        self.storage_dir
            .join(task_id.to_string())
            .join(format!("{OUTPUT_STEM}.{}", format.extension()))
    }

    async fn download(&self, url: &str) -> TranscodeResult<DownloadedSource> {
        let parsed = Url::parse(url).map_err(|err| TranscodeError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let temp = tempfile::Builder::new()
            .prefix("imgcache-source-")
            .tempfile()?;

        if parsed.scheme() == "file" {
            let source_path = parsed
                .to_file_path()
                .map_err(|_| TranscodeError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".into(),
                })?;
            fs::copy(&source_path, temp.path())
                .await
                .map_err(|source| TranscodeError::Io {
                    path: source_path.clone(),
                    source,
                })?;
            return Ok(DownloadedSource {
                file: temp,
                original_filename: filename::resolve(None, url),
            });
        }

        let response = self
            .http_client
            .get(parsed)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| TranscodeError::Download(err.to_string()))?;
        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let original_filename = filename::resolve(disposition.as_deref(), url);

        let mut file = fs::File::create(temp.path())
            .await
            .map_err(|source| TranscodeError::Io {
                path: temp.path().to_path_buf(),
                source,
            })?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| TranscodeError::Io {
                    path: temp.path().to_path_buf(),
                    source,
                })?;
        }
        file.flush().await?;

        Ok(DownloadedSource {
            file: temp,
            original_filename,
        })
    }
}

#[async_trait]
impl Transcoder for ImageTranscoder {
    async fn transcode(
        &self,
        source_url: &str,
        format: TargetFormat,
        task_id: i64,
    ) -> TranscodeResult<TranscodeOutput> {
        let source = self.download(source_url).await?;
        let output = self.output_path(task_id, format);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| TranscodeError::Io {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
        }

        let settings = *self.settings;
        let input = source.file.path().to_path_buf();
        let target = output.clone();
        tokio::task::spawn_blocking(move || encode_file(&input, &target, format, &settings))
            .await??;
        debug!(task_id, path = %output.display(), "artifact written");

        // The temp file is only removed once encoding has finished with it.
        drop(source.file);
        Ok(TranscodeOutput {
            result_location: output,
            original_filename: Some(source.original_filename),
        })
    }
}

/// Decodes `input` (format sniffed from its bytes) and writes it to `output`
/// as `format`.
pub fn encode_file(
    input: &Path,
    output: &Path,
    format: TargetFormat,
    settings: &EncodeSettings,
) -> TranscodeResult<()> {
    let decoded = ImageReader::open(input)
        .map_err(|source| TranscodeError::Io {
            path: input.to_path_buf(),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| TranscodeError::Io {
            path: input.to_path_buf(),
            source,
        })?
        .decode()?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();

    let file = File::create(output).map_err(|source| TranscodeError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    match format {
        TargetFormat::Webp => {
            let mut config = webp::WebPConfig::new()
                .map_err(|()| TranscodeError::Encode("webp: config init failed".into()))?;
            config.lossless = 0;
            config.quality = f32::from(settings.webp_quality);
            config.method = i32::from(settings.webp_method);
            let encoded = webp::Encoder::from_rgba(rgba.as_raw(), width, height)
                .encode_advanced(&config)
                .map_err(|err| TranscodeError::Encode(format!("webp: {err:?}")))?;
            writer.write_all(&encoded)?;
        }
        TargetFormat::Avif => {
            let encoder = AvifEncoder::new_with_speed_quality(
                &mut writer,
                settings.avif_speed,
                settings.avif_quality,
            );
            encoder.write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)?;
        }
    }
    writer.flush().map_err(|source| TranscodeError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("fixture.png");
        let img = ImageBuffer::from_fn(16, 12, |x, y| Rgb([(x * 15) as u8, (y * 20) as u8, 128]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn encodes_png_to_webp() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_fixture(dir.path());
        let output = dir.path().join("out.webp");
        encode_file(&input, &output, TargetFormat::Webp, &EncodeSettings::default()).unwrap();
        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
    }

    #[test]
    fn webp_method_range_encodes_lossy_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_fixture(dir.path());
        for method in [0u8, 6] {
            let output = dir.path().join(format!("m{method}.webp"));
            let settings = EncodeSettings {
                webp_method: method,
                ..EncodeSettings::default()
            };
            encode_file(&input, &output, TargetFormat::Webp, &settings).unwrap();
            let bytes = std::fs::read(&output).unwrap();
            assert_eq!(&bytes[0..4], b"RIFF");
            assert_eq!(&bytes[8..12], b"WEBP");
            assert_ne!(&bytes[12..16], b"VP8L", "method {method} produced lossless output");
        }
    }

    #[test]
    fn rejects_non_image_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("not-an-image.txt");
        std::fs::write(&input, b"plain text").unwrap();
        let output = dir.path().join("out.webp");
        let err = encode_file(&input, &output, TargetFormat::Webp, &EncodeSettings::default())
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Image(_)));
    }

    #[tokio::test]
    async fn transcodes_file_url_into_task_directory() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_fixture(dir.path());
        let storage = dir.path().join("images");
        let transcoder =
            ImageTranscoder::new(&storage, &TranscodeSection::default()).unwrap();
        let url = Url::from_file_path(&input).unwrap().to_string();

        let output = transcoder
            .transcode(&url, TargetFormat::Webp, 42)
            .await
            .unwrap();
        assert_eq!(output.result_location, storage.join("42").join("converted.webp"));
        assert_eq!(output.original_filename.as_deref(), Some("fixture.png"));
        assert!(output.result_location.exists());
    }

    #[tokio::test]
    async fn missing_local_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder =
            ImageTranscoder::new(dir.path(), &TranscodeSection::default()).unwrap();
        let url = Url::from_file_path(dir.path().join("missing.png"))
            .unwrap()
            .to_string();
        let result = transcoder.transcode(&url, TargetFormat::Avif, 1).await;
        assert!(matches!(result, Err(TranscodeError::Io { .. })));
    }
}
