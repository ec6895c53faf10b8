//! Recording directory and frame file output

use chrono::{DateTime, Local};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, GrayImage, ImageBuffer, ImageError, Luma, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::RecordError;
use crate::frame::{FrameBuffer, PixelFormat};

/// Attempts at finding a free session directory name
pub const MAX_DIRECTORY_ATTEMPTS: u32 = 10;

/// On-disk encoding of recorded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Buffer bytes exactly as held in memory
    Raw,
    /// Lossless, 16-bit grey for depth frames
    #[default]
    Png,
    /// Truecolour or 8-bit grey; depth is scaled down to 8 bits
    Tga,
}

impl RecordFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordFormat::Raw => "raw",
            RecordFormat::Png => "png",
            RecordFormat::Tga => "tga",
        }
    }
}

impl FromStr for RecordFormat {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(RecordFormat::Raw),
            "png" => Ok(RecordFormat::Png),
            "tga" => Ok(RecordFormat::Tga),
            other => Err(RecordError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Session directory name for a prefix and start time
pub fn directory_name(prefix: &str, time: &DateTime<Local>) -> String {
    format!("{} {}", prefix, time.format("%Y-%m-%d %H-%M-%S-%3f"))
}

/// Create a fresh session directory under `root`.
///
/// Tries the plain name first, then the name with ` 1`, ` 2`, ... appended.
/// An existing directory is never reused.
pub fn create_session_directory(root: &Path, prefix: &str, time: &DateTime<Local>) -> Result<PathBuf, RecordError> {
    let base = directory_name(prefix, time);

    for attempt in 0..MAX_DIRECTORY_ATTEMPTS {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{} {}", base, attempt)
        };
        let path = root.join(name);

        match fs::create_dir_all(root).and_then(|_| fs::create_dir(&path)) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(RecordError::CreateDirectory {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }

    Err(RecordError::DirectoryExists(root.display().to_string()))
}

/// File name for the `index`th frame
pub fn frame_file_name(index: u64, format: RecordFormat) -> String {
    format!("{:08}.{}", index, format.extension())
}

/// Write one frame to `path`.
///
/// `compress` selects RLE for TGA and a slower, smaller deflate for PNG.
/// Raw output ignores it.
pub fn write_frame(path: &Path, buffer: &FrameBuffer, format: RecordFormat, compress: bool) -> Result<(), RecordError> {
    let image = match format {
        RecordFormat::Raw => None,
        RecordFormat::Png | RecordFormat::Tga => Some(to_image(buffer).ok_or(RecordError::Unsupported {
            format,
            pixel_format: buffer.format(),
        })?),
    };

    let write_error = |source: io::Error| RecordError::Write {
        path: path.display().to_string(),
        source,
    };
    let encode_error = |source: ImageError| RecordError::Encode {
        path: path.display().to_string(),
        source,
    };

    let mut out = BufWriter::new(File::create(path).map_err(write_error)?);
    match (format, image) {
        (RecordFormat::Png, Some(image)) => {
            let compression = if compress {
                CompressionType::Best
            } else {
                CompressionType::Fast
            };
            let encoder = PngEncoder::new_with_quality(&mut out, compression, FilterType::Adaptive);
            image.write_with_encoder(encoder).map_err(encode_error)?;
        }
        (RecordFormat::Tga, Some(image)) => {
            // TGA has no 16-bit grey
            let image = match image {
                DynamicImage::ImageLuma16(_) => DynamicImage::ImageLuma8(image.to_luma8()),
                other => other,
            };
            let encoder = TgaEncoder::new(&mut out);
            let encoder = if compress { encoder } else { encoder.disable_rle() };
            image.write_with_encoder(encoder).map_err(encode_error)?;
        }
        _ => out.write_all(buffer.as_bytes()).map_err(write_error)?,
    }
    out.flush().map_err(write_error)
}

/// Image view of a frame, `None` for layouts no image format can hold
fn to_image(buffer: &FrameBuffer) -> Option<DynamicImage> {
    let resolution = buffer.resolution();
    let (width, height) = (resolution.width, resolution.height);
    let bytes = buffer.as_bytes().to_vec();

    match buffer.format() {
        PixelFormat::Alpha | PixelFormat::Luminance => {
            GrayImage::from_raw(width, height, bytes).map(DynamicImage::ImageLuma8)
        }
        PixelFormat::Depth => {
            let samples: Vec<u16> = (0..buffer.sample_count()).filter_map(|i| buffer.sample(i)).collect();
            ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, samples).map(DynamicImage::ImageLuma16)
        }
        PixelFormat::Rgb => RgbImage::from_raw(width, height, bytes).map(DynamicImage::ImageRgb8),
        PixelFormat::Rgba => RgbaImage::from_raw(width, height, bytes).map(DynamicImage::ImageRgba8),
        PixelFormat::Displacement => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Resolution;
    use chrono::TimeZone;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("depth-relay-writer-{}-{}", std::process::id(), name))
    }

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    #[test]
    fn test_directory_name_format() {
        assert_eq!(directory_name("Depth", &fixed_time()), "Depth 2024-03-05 14-07-09-000");
    }

    #[test]
    fn test_session_directory_suffixes() {
        let root = temp_root("suffix");
        let time = fixed_time();

        let first = create_session_directory(&root, "Cap", &time).unwrap();
        let second = create_session_directory(&root, "Cap", &time).unwrap();
        assert!(first.ends_with("Cap 2024-03-05 14-07-09-000"));
        assert!(second.ends_with("Cap 2024-03-05 14-07-09-000 1"));

        for _ in 2..MAX_DIRECTORY_ATTEMPTS {
            create_session_directory(&root, "Cap", &time).unwrap();
        }
        assert!(matches!(
            create_session_directory(&root, "Cap", &time),
            Err(RecordError::DirectoryExists(_))
        ));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_frame_file_names() {
        assert_eq!(frame_file_name(0, RecordFormat::Raw), "00000000.raw");
        assert_eq!(frame_file_name(42, RecordFormat::Png), "00000042.png");
        assert_eq!(frame_file_name(7, RecordFormat::Tga), "00000007.tga");
    }

    fn depth_buffer() -> FrameBuffer {
        let mut buffer = FrameBuffer::new();
        buffer.create(Resolution::new(2, 2), PixelFormat::Depth).unwrap();
        buffer.write_samples(&[0x0102, 0xFFFF, 0x8000, 0]);
        buffer
    }

    #[test]
    fn test_depth_png_keeps_16_bits() {
        let root = temp_root("png");
        fs::create_dir_all(&root).unwrap();

        for compress in [false, true] {
            let path = root.join(format!("frame-{}.png", compress));
            write_frame(&path, &depth_buffer(), RecordFormat::Png, compress).unwrap();

            let decoded = image::open(&path).unwrap();
            let decoded = decoded.as_luma16().expect("16-bit grey png");
            assert_eq!(decoded.dimensions(), (2, 2));
            assert_eq!(decoded.as_raw(), &vec![0x0102, 0xFFFF, 0x8000, 0]);
        }

        let raw = root.join("frame.raw");
        write_frame(&raw, &depth_buffer(), RecordFormat::Raw, true).unwrap();
        assert_eq!(fs::read(&raw).unwrap(), depth_buffer().as_bytes());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_tga_output() {
        let root = temp_root("tga");
        fs::create_dir_all(&root).unwrap();

        let mut colour = FrameBuffer::new();
        colour.create(Resolution::new(2, 1), PixelFormat::Rgb).unwrap();
        colour.write_bytes(&[10, 20, 30, 40, 50, 60]);

        for compress in [false, true] {
            let path = root.join(format!("colour-{}.tga", compress));
            write_frame(&path, &colour, RecordFormat::Tga, compress).unwrap();
            let decoded = image::open(&path).unwrap().to_rgb8();
            assert_eq!(decoded.as_raw(), &vec![10, 20, 30, 40, 50, 60]);
        }

        let path = root.join("depth.tga");
        write_frame(&path, &depth_buffer(), RecordFormat::Tga, false).unwrap();
        let decoded = image::open(&path).unwrap().to_luma8();
        assert_eq!(decoded.as_raw(), &vec![0x01, 0xFF, 0x80, 0x00]);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_displacement_has_no_image_encoding() {
        let root = temp_root("displacement");
        fs::create_dir_all(&root).unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.create(Resolution::new(1, 1), PixelFormat::Displacement).unwrap();

        let result = write_frame(&root.join("frame.png"), &buffer, RecordFormat::Png, false);
        assert!(matches!(result, Err(RecordError::Unsupported { .. })));
        assert!(!root.join("frame.png").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_unknown_format() {
        assert_eq!("PNG".parse::<RecordFormat>().unwrap(), RecordFormat::Png);
        assert_eq!("tga".parse::<RecordFormat>().unwrap(), RecordFormat::Tga);
        assert!(matches!("pnm".parse::<RecordFormat>(), Err(RecordError::UnknownFormat(_))));
    }
}
