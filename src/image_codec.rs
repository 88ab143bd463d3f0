// Decoding of uploaded images and encoding of results.

use crate::error::InferenceError;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Encodings a response can be produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg { quality: u8 },
    /// Lossless WebP
    WebP,
}

impl OutputFormat {
    pub fn supports_alpha(self) -> bool {
        !matches!(self, OutputFormat::Jpeg { .. })
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg { .. } => "image/jpeg",
            OutputFormat::WebP => "image/webp",
        }
    }
}

impl TryFrom<&mime::Mime> for OutputFormat {
    type Error = ();

    fn try_from(value: &mime::Mime) -> Result<Self, Self::Error> {
        if value.type_() != mime::IMAGE {
            return Err(());
        }

        match value.subtype().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => {
                let quality = value
                    .get_param("quality")
                    .and_then(|q| q.as_str().parse::<u8>().ok())
                    .map(|q| q.clamp(1, 100))
                    .unwrap_or(DEFAULT_JPEG_QUALITY);
                Ok(OutputFormat::Jpeg { quality })
            }
            "webp" => Ok(OutputFormat::WebP),
            _ => Err(()),
        }
    }
}

fn format_hint(content_type: &str) -> Option<ImageFormat> {
    let media_type = content_type[..content_type.find(';').unwrap_or(content_type.len())]
        .trim()
        .to_ascii_lowercase();

    match media_type.as_str() {
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/png" => Some(ImageFormat::Png),
        "image/webp" => Some(ImageFormat::WebP),
        "image/gif" => Some(ImageFormat::Gif),
        "image/bmp" | "image/x-bmp" => Some(ImageFormat::Bmp),
        "image/tiff" => Some(ImageFormat::Tiff),
        _ => None,
    }
}

/// Decodes `bytes` into a pixel buffer. A recognised `image/*` content type
/// selects the decoder; otherwise, or when that decoder rejects the data,
/// the format is sniffed from the bytes.
pub fn decode_input_image(
    bytes: &[u8],
    content_type: Option<&str>,
) -> Result<DynamicImage, InferenceError> {
    if let Some(format) = content_type.and_then(format_hint) {
        match image::load_from_memory_with_format(bytes, format) {
            Ok(image) => return Ok(image),
            Err(e) => debug!(
                "Decoding as {:?} failed ({}), falling back to format detection",
                format, e
            ),
        }
    }

    Ok(image::load_from_memory(bytes)?)
}

/// An encoded response image.
#[derive(Debug)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Encodes `image` as `format`. Alpha is dropped for formats that cannot
/// carry it.
pub fn encode_image(
    image: &DynamicImage,
    format: OutputFormat,
) -> Result<EncodedImage, InferenceError> {
    let (width, height) = (image.width(), image.height());
    let mut buffer = Cursor::new(Vec::new());

    match format {
        OutputFormat::Jpeg { quality } => {
            debug!("Encoding {}x{} output as JPEG (quality {})", width, height, quality);
            let rgb = image.to_rgb8();
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality);
            encoder.encode(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)?;
        }
        OutputFormat::Png | OutputFormat::WebP => {
            let image_format = if format == OutputFormat::Png {
                ImageFormat::Png
            } else {
                ImageFormat::WebP
            };
            debug!("Encoding {}x{} output as {:?}", width, height, image_format);

            if image.color().has_alpha() {
                let rgba = image.to_rgba8();
                image::write_buffer_with_format(
                    &mut buffer,
                    rgba.as_raw(),
                    width,
                    height,
                    image::ColorType::Rgba8,
                    image_format,
                )?;
            } else {
                let rgb = image.to_rgb8();
                image::write_buffer_with_format(
                    &mut buffer,
                    rgb.as_raw(),
                    width,
                    height,
                    image::ColorType::Rgb8,
                    image_format,
                )?;
            }
        }
    }

    Ok(EncodedImage {
        bytes: buffer.into_inner(),
        content_type: format.content_type(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::encoded_image;
    use image::{Rgba, RgbaImage};

    #[test]
    fn mime_types_map_to_formats() {
        let png: mime::Mime = "image/png".parse().unwrap();
        let jpeg: mime::Mime = "image/jpeg".parse().unwrap();
        let jpeg_q: mime::Mime = "image/jpeg; quality=70".parse().unwrap();
        let webp: mime::Mime = "image/webp".parse().unwrap();
        let gif: mime::Mime = "image/gif".parse().unwrap();
        let json = mime::APPLICATION_JSON;

        assert_eq!(OutputFormat::try_from(&png), Ok(OutputFormat::Png));
        assert_eq!(
            OutputFormat::try_from(&jpeg),
            Ok(OutputFormat::Jpeg { quality: 95 })
        );
        assert_eq!(
            OutputFormat::try_from(&jpeg_q),
            Ok(OutputFormat::Jpeg { quality: 70 })
        );
        assert_eq!(OutputFormat::try_from(&webp), Ok(OutputFormat::WebP));
        assert!(OutputFormat::try_from(&gif).is_err());
        assert!(OutputFormat::try_from(&json).is_err());
    }

    #[test]
    fn jpeg_cannot_carry_alpha() {
        assert!(OutputFormat::Png.supports_alpha());
        assert!(OutputFormat::WebP.supports_alpha());
        assert!(!OutputFormat::Jpeg { quality: 95 }.supports_alpha());
    }

    #[test]
    fn decodes_with_and_without_content_type() {
        let jpeg = encoded_image(12, 8, ImageFormat::Jpeg);

        let hinted = decode_input_image(&jpeg, Some("image/jpeg; charset=binary")).unwrap();
        assert_eq!((hinted.width(), hinted.height()), (12, 8));

        let sniffed = decode_input_image(&jpeg, Some("application/octet-stream")).unwrap();
        assert_eq!((sniffed.width(), sniffed.height()), (12, 8));

        let mislabeled = decode_input_image(&jpeg, Some("image/png")).unwrap();
        assert_eq!((mislabeled.width(), mislabeled.height()), (12, 8));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode_input_image(b"definitely not an image", None).unwrap_err();
        assert!(matches!(err, InferenceError::Image(_)));
    }

    #[test]
    fn png_keeps_alpha() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(5, 4, Rgba([1, 2, 3, 40])));

        let encoded = encode_image(&image, OutputFormat::Png).unwrap();
        assert_eq!(encoded.content_type, "image/png");
        assert_eq!((encoded.width, encoded.height), (5, 4));

        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert!(decoded.color().has_alpha());
        assert_eq!(decoded.to_rgba8().get_pixel(0, 0).0, [1, 2, 3, 40]);
    }

    #[test]
    fn jpeg_drops_alpha() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([200, 10, 10, 0])));

        let encoded = encode_image(&image, OutputFormat::Jpeg { quality: 90 }).unwrap();
        assert_eq!(encoded.content_type, "image/jpeg");

        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert!(!decoded.color().has_alpha());
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn webp_output_is_decodable() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(6, 6, Rgba([9, 8, 7, 128])));

        let encoded = encode_image(&image, OutputFormat::WebP).unwrap();
        let decoded = image::load_from_memory_with_format(&encoded.bytes, ImageFormat::WebP).unwrap();
        assert_eq!(decoded.to_rgba8().get_pixel(3, 3).0, [9, 8, 7, 128]);
    }
}
