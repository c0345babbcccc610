//! Raster processor built on the `image` crate.
//!
//! Decoding and encoding are CPU-bound and run on the blocking pool. The
//! source is loaded into memory once per processor; sources with direct
//! range seeks are read through a [`BlockCache`] so the format check only
//! fetches the first block of a mismatched object.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Processor, ProcessorFactory, ProcessorInput};
use crate::error::{ProcessorError, ValidationError};
use crate::image::{
    Color, Dimension, Encode, Format, ImageInfo, Info, Metadata, Operation, OperationList,
    Orientation, MAGIC_BYTES_LENGTH,
};
use crate::io::{read_all, read_head, BlockCache, FileRangeReader, RangeReader};

/// Default JPEG quality when the operation list does not set one.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

const SUPPORTED_FORMATS: &[Format] = &[
    Format::Jpeg,
    Format::Png,
    Format::Gif,
    Format::Tiff,
    Format::Webp,
];

fn image_format(format: Format) -> Option<ImageFormat> {
    match format {
        Format::Jpeg => Some(ImageFormat::Jpeg),
        Format::Png => Some(ImageFormat::Png),
        Format::Gif => Some(ImageFormat::Gif),
        Format::Tiff => Some(ImageFormat::Tiff),
        Format::Webp => Some(ImageFormat::WebP),
        _ => None,
    }
}

fn decode_error(err: image::ImageError) -> ProcessorError {
    ProcessorError::Decode(err.to_string())
}

fn encode_error(err: image::ImageError) -> ProcessorError {
    ProcessorError::Encode(err.to_string())
}

fn join_error(err: tokio::task::JoinError) -> ProcessorError {
    ProcessorError::Io(format!("processing task failed: {}", err))
}

// =============================================================================
// RasterProcessor
// =============================================================================

pub struct RasterProcessor {
    format: Format,
    image_format: ImageFormat,
    input: Option<ProcessorInput>,
    /// Source bytes, loaded on first use
    data: Option<Bytes>,
}

impl RasterProcessor {
    pub fn new(format: Format) -> Result<Self, ProcessorError> {
        let image_format =
            image_format(format).ok_or(ProcessorError::UnsupportedSourceFormat(format))?;
        Ok(Self {
            format,
            image_format,
            input: None,
            data: None,
        })
    }

    fn check_magic_bytes(&self, head: &[u8]) -> Result<(), ProcessorError> {
        let detected = Format::from_magic_bytes(head);
        if !detected.is_unknown() && detected != self.format {
            return Err(ProcessorError::SourceFormatMismatch {
                expected: self.format,
                detected,
            });
        }
        Ok(())
    }

    /// Verify the leading bytes, then read everything.
    async fn load_from(&self, reader: &dyn RangeReader) -> Result<Bytes, ProcessorError> {
        self.check_magic_bytes(&read_head(reader, MAGIC_BYTES_LENGTH).await?)?;
        Ok(read_all(reader).await?)
    }

    async fn load(&mut self) -> Result<Bytes, ProcessorError> {
        if let Some(data) = &self.data {
            return Ok(data.clone());
        }
        let input = self.input.as_ref().ok_or(ProcessorError::NoInput)?;
        let data = match input {
            ProcessorInput::File(path) => {
                let reader = FileRangeReader::open(path).await?;
                self.load_from(&reader).await?
            }
            ProcessorInput::Stream(factory) if factory.is_seeking_direct() => {
                let reader = BlockCache::new(factory.new_seekable_stream().await?);
                self.load_from(&reader).await?
            }
            ProcessorInput::Stream(factory) => {
                let mut stream = factory.new_stream().await?;
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                self.check_magic_bytes(&buf)?;
                Bytes::from(buf)
            }
        };
        debug!(format = %self.format, bytes = data.len(), "Loaded source");
        self.data = Some(data.clone());
        Ok(data)
    }
}

#[async_trait]
impl Processor for RasterProcessor {
    fn name(&self) -> &'static str {
        "RasterProcessor"
    }

    fn source_format(&self) -> Format {
        self.format
    }

    fn accepts_file(&self) -> bool {
        true
    }

    fn accepts_stream(&self) -> bool {
        true
    }

    fn set_input(&mut self, input: ProcessorInput) {
        self.input = Some(input);
        self.data = None;
    }

    fn available_output_formats(&self) -> &'static [Format] {
        SUPPORTED_FORMATS
    }

    async fn read_info(&mut self) -> Result<Info, ProcessorError> {
        let data = self.load().await?;
        let image_format = self.image_format;
        let (size, metadata) = tokio::task::spawn_blocking(move || read_header(&data, image_format))
            .await
            .map_err(join_error)??;
        Ok(Info::new(self.format, vec![ImageInfo::untiled(size.width, size.height)])
            .with_metadata(metadata))
    }

    fn validate(&self, ops: &OperationList, full_size: Dimension) -> Result<(), ValidationError> {
        ops.validate(full_size)?;
        for op in ops.operations() {
            if let Operation::Rotate(rotate) = op {
                if !rotate.is_right_angle() {
                    return Err(ValidationError::UnsupportedRotation(rotate.degrees()));
                }
            }
        }
        Ok(())
    }

    async fn process(
        &mut self,
        ops: &OperationList,
        _info: &Info,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ProcessorError> {
        let encode = ops
            .encode()
            .cloned()
            .ok_or(ProcessorError::UnsupportedOutputFormat(Format::Unknown))?;
        if !SUPPORTED_FORMATS.contains(&encode.format) {
            return Err(ProcessorError::UnsupportedOutputFormat(encode.format));
        }

        let data = self.load().await?;
        let image_format = self.image_format;
        let ops = ops.clone();
        let encoded = tokio::task::spawn_blocking(move || {
            let image = render(&data, image_format, &ops)?;
            encode_image(image, &encode)
        })
        .await
        .map_err(join_error)??;

        out.write_all(&encoded).await?;
        out.flush().await?;
        Ok(())
    }

    fn close(&mut self) {
        self.data = None;
    }
}

fn read_header(data: &[u8], format: ImageFormat) -> Result<(Dimension, Metadata), ProcessorError> {
    let mut decoder = ImageReader::with_format(Cursor::new(data), format)
        .into_decoder()
        .map_err(decode_error)?;
    let (width, height) = decoder.dimensions();
    let exif = decoder.exif_metadata().ok().flatten();
    let orientation = decoder
        .orientation()
        .map(|o| Orientation::from_exif(u16::from(o.to_exif())))
        .unwrap_or_default();
    Ok((
        Dimension::new(width, height),
        Metadata {
            exif,
            orientation,
            ..Default::default()
        },
    ))
}

/// Decode and apply the geometric operations in order.
fn render(data: &[u8], format: ImageFormat, ops: &OperationList) -> Result<DynamicImage, ProcessorError> {
    let mut image = ImageReader::with_format(Cursor::new(data), format)
        .decode()
        .map_err(decode_error)?;
    let constraint = ops.scale_constraint();

    for op in ops.operations() {
        let size = Dimension::new(image.width(), image.height());
        match op {
            Operation::Crop(crop) if crop.has_effect(size) => {
                let region = crop.region(size);
                image = image.crop_imm(region.x, region.y, region.width, region.height);
            }
            Operation::Scale(scale) if scale.has_effect(size, constraint) => {
                let target = scale.resulting_size(size, constraint);
                image = image.resize_exact(target.width, target.height, FilterType::Lanczos3);
            }
            Operation::Rotate(rotate) => {
                if rotate.is_mirrored() {
                    image = image.fliph();
                }
                image = match rotate.degrees() as u32 {
                    90 => image.rotate90(),
                    180 => image.rotate180(),
                    270 => image.rotate270(),
                    _ => image,
                };
            }
            _ => {}
        }
    }
    Ok(image)
}

fn encode_image(image: DynamicImage, encode: &Encode) -> Result<Vec<u8>, ProcessorError> {
    let image = if !encode.format.supports_transparency() && image.color().has_alpha() {
        flatten(&image, encode.background.unwrap_or(Color::WHITE))
    } else {
        image
    };

    let mut out = Vec::new();
    match encode.format {
        Format::Jpeg => {
            let quality = encode.quality.unwrap_or(DEFAULT_JPEG_QUALITY).clamp(1, 100);
            JpegEncoder::new_with_quality(&mut out, quality)
                .encode_image(&image.to_rgb8())
                .map_err(encode_error)?;
        }
        Format::Gif | Format::Webp => {
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), image_format_for(encode.format)?)
                .map_err(encode_error)?;
        }
        other => {
            image
                .write_to(&mut Cursor::new(&mut out), image_format_for(other)?)
                .map_err(encode_error)?;
        }
    }
    Ok(out)
}

fn image_format_for(format: Format) -> Result<ImageFormat, ProcessorError> {
    image_format(format).ok_or(ProcessorError::UnsupportedOutputFormat(format))
}

/// Composite over an opaque background.
fn flatten(image: &DynamicImage, background: Color) -> DynamicImage {
    let rgba = image.to_rgba8();
    let mut flat = RgbImage::new(rgba.width(), rgba.height());
    let blend = |fg: u8, bg: u8, alpha: u8| -> u8 {
        let alpha = u32::from(alpha);
        ((u32::from(fg) * alpha + u32::from(bg) * (255 - alpha)) / 255) as u8
    };
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        flat.put_pixel(
            x,
            y,
            image::Rgb([
                blend(r, background.r, a),
                blend(g, background.g, a),
                blend(b, background.b, a),
            ]),
        );
    }
    DynamicImage::ImageRgb8(flat)
}

// =============================================================================
// Factory
// =============================================================================

/// Creates a [`RasterProcessor`] for every format it can decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterProcessorFactory;

impl ProcessorFactory for RasterProcessorFactory {
    fn new_processor(&self, format: Format) -> Result<Box<dyn Processor>, ProcessorError> {
        Ok(Box::new(RasterProcessor::new(format)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Crop, Identifier, Rotate, Scale};
    use image::{Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 0])
            }
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn processor_for(path: &std::path::Path, format: Format) -> RasterProcessor {
        let mut processor = RasterProcessor::new(format).unwrap();
        processor.set_input(ProcessorInput::File(path.to_path_buf()));
        processor
    }

    #[tokio::test]
    async fn test_read_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, png_bytes(64, 56)).unwrap();

        let mut processor = processor_for(&path, Format::Png);
        let info = processor.read_info().await.unwrap();
        assert_eq!(info.size(0).unwrap(), Dimension::new(64, 56));
        assert_eq!(info.source_format(), Format::Png);
    }

    #[tokio::test]
    async fn test_mismatched_content_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, png_bytes(8, 8)).unwrap();

        let mut processor = processor_for(&path, Format::Jpeg);
        assert!(matches!(
            processor.read_info().await,
            Err(ProcessorError::SourceFormatMismatch {
                expected: Format::Jpeg,
                detected: Format::Png
            })
        ));
    }

    #[test]
    fn test_unsupported_source_format() {
        assert!(matches!(
            RasterProcessor::new(Format::Pdf),
            Err(ProcessorError::UnsupportedSourceFormat(Format::Pdf))
        ));
        assert!(RasterProcessorFactory.new_processor(Format::Jp2).is_err());
    }

    #[tokio::test]
    async fn test_no_input() {
        let mut processor = RasterProcessor::new(Format::Png).unwrap();
        assert!(matches!(
            processor.read_info().await,
            Err(ProcessorError::NoInput)
        ));
    }

    #[tokio::test]
    async fn test_process_crop_scale_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, png_bytes(64, 56)).unwrap();

        let mut processor = processor_for(&path, Format::Png);
        let info = processor.read_info().await.unwrap();
        let ops = OperationList::new(Identifier::from("a.png"))
            .with(Operation::Crop(Crop::Pixels {
                x: 0,
                y: 0,
                width: 32,
                height: 16,
            }))
            .with(Operation::Scale(Scale::Percent(0.5)))
            .with(Operation::Rotate(Rotate::new(90.0)))
            .with(Operation::Encode(Encode::new(Format::Jpeg)));
        processor.validate(&ops, Dimension::new(64, 56)).unwrap();

        let mut out = Vec::new();
        processor.process(&ops, &info, &mut out).await.unwrap();
        assert_eq!(Format::from_magic_bytes(&out), Format::Jpeg);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 16));
    }

    #[test]
    fn test_validate_rejects_free_rotation() {
        let processor = RasterProcessor::new(Format::Png).unwrap();
        let ops = OperationList::new(Identifier::from("a.png"))
            .with(Operation::Rotate(Rotate::new(45.0)))
            .with(Operation::Encode(Encode::new(Format::Png)));
        assert_eq!(
            processor.validate(&ops, Dimension::new(10, 10)),
            Err(ValidationError::UnsupportedRotation(45.0))
        );
    }

    #[test]
    fn test_flatten_uses_background() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 0])));
        let flat = flatten(&image, Color { r: 10, g: 20, b: 30 });
        assert_eq!(flat.to_rgb8().get_pixel(0, 0).0, [10, 20, 30]);
    }
}
