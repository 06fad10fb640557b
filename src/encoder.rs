use crate::format::ImageType;
use crate::size::ImageSize;
use anyhow::{Context, Result, anyhow};
use color_quant::NeuQuant;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageReader};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

const FALLBACK_QUALITY: u8 = 80;
const AVIF_SPEED: u8 = 6;
const QUANTIZE_SAMPLE_FACTOR: i32 = 10;
const QUANTIZE_COLORS: usize = 256;

/// One encode job for the codec backend: target dimensions, format, quality
/// (ignored by formats without a quality knob) and whether PNG output should
/// use an indexed palette.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest {
    pub size: ImageSize,
    pub format: ImageType,
    pub quality: Option<u8>,
    pub palette: bool,
}

/// Reads the natural pixel dimensions of an image without decoding pixel
/// data.
pub async fn probe_dimensions(path: &Path) -> Result<ImageSize> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<ImageSize> {
        let (width, height) = ImageReader::open(&path)?
            .with_guessed_format()?
            .into_dimensions()
            .with_context(|| format!("read dimensions of {:?}", path))?;
        Ok(ImageSize::new(width, height))
    })
    .await?
}

/// Whether the source is an 8-bit palette PNG. Only such sources opt into
/// palette output; re-quantizing a full-color source would silently degrade
/// it.
pub async fn is_palette_png(path: &Path) -> bool {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || probe_palette(&path))
        .await
        .unwrap_or(false)
}

fn probe_palette(path: &PathBuf) -> bool {
    let is_png = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("png"))
        .unwrap_or(false);
    if !is_png {
        return false;
    }
    let Ok(file) = File::open(path) else {
        return false;
    };
    let decoder = png::Decoder::new(BufReader::new(file));
    let Ok(reader) = decoder.read_info() else {
        return false;
    };
    let info = reader.info();
    info.color_type == png::ColorType::Indexed && info.bit_depth == png::BitDepth::Eight
}

/// Decodes the source, resizes to the requested dimensions and encodes into
/// the requested format. Blocking; callers run it on a blocking thread.
pub fn encode(source: &Path, request: &EncodeRequest) -> Result<Vec<u8>> {
    let image = image::open(source).with_context(|| format!("decode {:?}", source))?;
    let resized = image.resize_exact(request.size.width, request.size.height, FilterType::Lanczos3);
    let quality = request.quality.unwrap_or(FALLBACK_QUALITY);

    match request.format {
        ImageType::Jpeg => encode_jpeg(&resized, quality),
        ImageType::Webp => encode_webp(&resized, quality),
        ImageType::Avif => encode_avif(&resized, quality),
        ImageType::Png => {
            if request.palette {
                encode_png_palette(&resized)
            } else {
                encode_png(&resized)
            }
        }
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
    encoder.write_image(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(bytes)
}

fn encode_webp(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height());
    let memory = encoder.encode(f32::from(quality));
    Ok(memory.to_vec())
}

fn encode_avif(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    let encoder = AvifEncoder::new_with_speed_quality(&mut cursor, AVIF_SPEED, quality);
    encoder.write_image(
        rgba.as_raw(),
        rgba.width(),
        rgba.height(),
        ExtendedColorType::Rgba8,
    )?;
    Ok(bytes)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    let encoder = PngEncoder::new_with_quality(
        &mut cursor,
        CompressionType::Best,
        PngFilterType::Adaptive,
    );
    encoder.write_image(
        rgba.as_raw(),
        rgba.width(),
        rgba.height(),
        ExtendedColorType::Rgba8,
    )?;
    Ok(bytes)
}

/// Quantizes to at most 256 colors and writes an indexed PNG, keeping the
/// output in the same reduced-palette class as its source.
fn encode_png_palette(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let pixels = rgba.as_raw();
    let quantizer = NeuQuant::new(QUANTIZE_SAMPLE_FACTOR, QUANTIZE_COLORS, pixels);

    let indices: Vec<u8> = pixels
        .chunks_exact(4)
        .map(|pixel| quantizer.index_of(pixel) as u8)
        .collect();
    let map = quantizer.color_map_rgba();
    let mut palette = Vec::with_capacity(QUANTIZE_COLORS * 3);
    let mut alpha = Vec::with_capacity(QUANTIZE_COLORS);
    for entry in map.chunks_exact(4) {
        palette.extend_from_slice(&entry[..3]);
        alpha.push(entry[3]);
    }

    let mut bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut bytes, rgba.width(), rgba.height());
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(palette);
        encoder.set_trns(alpha);
        encoder.set_compression(png::Compression::Best);
        let mut writer = encoder
            .write_header()
            .map_err(|err| anyhow!("write palette png header: {err}"))?;
        writer
            .write_image_data(&indices)
            .map_err(|err| anyhow!("write palette png data: {err}"))?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    fn write_test_png(path: &Path, width: u32, height: u32) {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        image.save(path).unwrap();
    }

    fn write_indexed_png(path: &Path, width: u32, height: u32) {
        let file = File::create(path).unwrap();
        let mut encoder = png::Encoder::new(file, width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(vec![0, 0, 0, 255, 255, 255]);
        let mut writer = encoder.write_header().unwrap();
        let data = vec![0u8; (width * height) as usize];
        writer.write_image_data(&data).unwrap();
    }

    #[tokio::test]
    async fn probe_reads_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("probe.png");
        write_test_png(&path, 120, 80);
        assert_eq!(
            probe_dimensions(&path).await.unwrap(),
            ImageSize::new(120, 80)
        );
    }

    #[tokio::test]
    async fn probe_fails_on_non_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(probe_dimensions(&path).await.is_err());
    }

    #[tokio::test]
    async fn palette_probe_distinguishes_indexed_sources() {
        let dir = tempdir().unwrap();
        let truecolor = dir.path().join("truecolor.png");
        write_test_png(&truecolor, 8, 8);
        let indexed = dir.path().join("indexed.png");
        write_indexed_png(&indexed, 8, 8);
        let jpeg_named = dir.path().join("photo.jpg");
        std::fs::write(&jpeg_named, b"irrelevant").unwrap();

        assert!(!is_palette_png(&truecolor).await);
        assert!(is_palette_png(&indexed).await);
        assert!(!is_palette_png(&jpeg_named).await);
    }

    #[test]
    fn encode_resizes_and_produces_decodable_output() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.png");
        write_test_png(&source, 100, 200);

        for format in [ImageType::Jpeg, ImageType::Webp, ImageType::Png] {
            let bytes = encode(
                &source,
                &EncodeRequest {
                    size: ImageSize::new(50, 100),
                    format,
                    quality: Some(80),
                    palette: false,
                },
            )
            .unwrap();
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (50, 100), "{format:?}");
        }
    }

    #[test]
    fn encode_avif_emits_avif_container() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.png");
        write_test_png(&source, 16, 16);
        let bytes = encode(
            &source,
            &EncodeRequest {
                size: ImageSize::new(8, 8),
                format: ImageType::Avif,
                quality: Some(50),
                palette: false,
            },
        )
        .unwrap();
        assert_eq!(&bytes[4..12], b"ftypavif");
    }

    #[test]
    fn palette_encode_writes_indexed_png() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("indexed.png");
        write_indexed_png(&source, 32, 32);

        let bytes = encode(
            &source,
            &EncodeRequest {
                size: ImageSize::new(16, 16),
                format: ImageType::Png,
                quality: None,
                palette: true,
            },
        )
        .unwrap();
        let decoder = png::Decoder::new(Cursor::new(&bytes));
        let reader = decoder.read_info().unwrap();
        assert_eq!(reader.info().color_type, png::ColorType::Indexed);
    }
}
