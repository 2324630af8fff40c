use std::io::Cursor;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::{Result, SharaqError};

mod options;
pub use options::Options;

/// Compression quality of resized jpegs
const JPEG_QUALITY: u8 = 95;

/// Resample filter used when resizing images
const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

/// Outcome of a transformation: the encoded bytes live in the buffer the
/// caller handed in.
#[derive(Debug)]
pub struct TransformResult {
    pub content_type: String,
    pub size: u64,
}

/// Fetches origin images and applies preset rules to them.
pub struct Transformer {
    client: reqwest::Client,
}

impl Transformer {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("sharaq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SharaqError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Fetch the image at `url`, apply the transformation described by
    /// `rule`, and write the encoded result into `out`.
    pub async fn transform(
        &self,
        rule: &str,
        url: &str,
        out: &mut Vec<u8>,
    ) -> Result<TransformResult> {
        let opts = Options::parse(rule);

        debug!("fetching remote URL: {}", url);
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SharaqError::Upstream(format!("failed to fetch remote image: {}", e)))?;

        if !res.status().is_success() {
            return Err(SharaqError::Upstream(format!(
                "failed to fetch remote image: {}",
                res.status()
            )));
        }

        let upstream_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = res
            .bytes()
            .await
            .map_err(|e| SharaqError::Upstream(format!("failed to read remote image: {}", e)))?;

        if opts.is_empty() {
            // bail if no transformation was requested
            out.extend_from_slice(&body);
            debug!("empty options, copied {} bytes", body.len());
            let content_type =
                upstream_type.unwrap_or_else(|| sniff_content_type(&body).to_string());
            return Ok(TransformResult {
                content_type,
                size: out.len() as u64,
            });
        }

        debug!("transforming image with rule '{}'", opts);
        let content_type = transform_bytes(&body, &opts, out)?;
        Ok(TransformResult {
            content_type: content_type.to_string(),
            size: out.len() as u64,
        })
    }
}

/// Transform the provided image. `src` holds the raw bytes of an encoded
/// gif, jpeg or png; the bytes of a similarly encoded image are appended
/// to `dst`. Empty options copy the input byte for byte.
pub fn transform_bytes(src: &[u8], opts: &Options, dst: &mut Vec<u8>) -> Result<&'static str> {
    if opts.is_empty() {
        dst.extend_from_slice(src);
        return Ok(sniff_content_type(src));
    }

    let format = image::guess_format(src)
        .map_err(|e| SharaqError::Decode(format!("unrecognized image data: {}", e)))?;
    if !matches!(
        format,
        ImageFormat::Gif | ImageFormat::Jpeg | ImageFormat::Png
    ) {
        return Err(SharaqError::Decode(format!(
            "unsupported image format: {:?}",
            format
        )));
    }

    let img = image::load_from_memory(src)
        .map_err(|e| SharaqError::Decode(format!("failed to decode image: {}", e)))?;

    let img = apply(img, opts);

    // output format follows input format
    let mut cursor = Cursor::new(dst);
    match format {
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut cursor, JPEG_QUALITY);
            img.write_with_encoder(encoder)
                .map_err(|e| SharaqError::Encode(format!("failed to encode jpeg: {}", e)))?;
            Ok("image/jpeg")
        }
        ImageFormat::Png => {
            img.write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| SharaqError::Encode(format!("failed to encode png: {}", e)))?;
            Ok("image/png")
        }
        _ => {
            img.write_to(&mut cursor, ImageFormat::Gif)
                .map_err(|e| SharaqError::Encode(format!("failed to encode gif: {}", e)))?;
            Ok("image/gif")
        }
    }
}

/// Content type from magic numbers. Only the three formats the service
/// ever stores are recognized.
pub fn sniff_content_type(b: &[u8]) -> &'static str {
    if b.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if b.starts_with(&[0xff, 0xd8]) {
        "image/jpeg"
    } else if b.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}

/// Convert the options' width/height into pixel dimensions for a source
/// image of the given size. Fractions of 1 are relative to the source;
/// negative values are ignored; the result never exceeds the source.
fn resolve_dimensions(img_w: u32, img_h: u32, opt: &Options) -> (u32, u32) {
    let resolve = |v: f64, src: u32| -> u32 {
        if v > 0.0 && v < 1.0 {
            (src as f64 * v).round() as u32
        } else if v < 0.0 {
            0
        } else {
            v.round() as u32
        }
    };

    let w = resolve(opt.width, img_w).min(img_w);
    let h = resolve(opt.height, img_h).min(img_h);
    (w, h)
}

/// Apply the transformations in `opt` to the decoded image, in the fixed
/// order resize, flip vertical, flip horizontal, rotate.
fn apply(mut m: DynamicImage, opt: &Options) -> DynamicImage {
    let (img_w, img_h) = (m.width(), m.height());
    let (w, h) = resolve_dimensions(img_w, img_h, opt);

    if w != 0 || h != 0 {
        m = if opt.fit && w != 0 && h != 0 {
            m.resize(w, h, RESAMPLE_FILTER)
        } else if w == 0 || h == 0 {
            // proportional resize on the non-zero axis
            let (tw, th) = if w == 0 {
                let tw = (img_w as f64 * h as f64 / img_h as f64).round() as u32;
                (tw.max(1), h)
            } else {
                let th = (img_h as f64 * w as f64 / img_w as f64).round() as u32;
                (w, th.max(1))
            };
            m.resize_exact(tw, th, RESAMPLE_FILTER)
        } else {
            // scale to fill, crop the excess around the center
            m.resize_to_fill(w, h, RESAMPLE_FILTER)
        };
    }

    if opt.flip_vertical {
        m = m.flipv();
    }
    if opt.flip_horizontal {
        m = m.fliph();
    }

    // rotation is counter-clockwise; the codec rotates clockwise
    match opt.rotate {
        90 => m.rotate270(),
        180 => m.rotate180(),
        270 => m.rotate90(),
        _ => m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn sample_png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn transformed_dims(src: &[u8], rule: &str) -> (u32, u32) {
        let mut out = Vec::new();
        transform_bytes(src, &Options::parse(rule), &mut out).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn empty_options_copy_bytes_verbatim() {
        let src = sample_png(4, 3);
        let mut out = Vec::new();
        let ct = transform_bytes(&src, &Options::default(), &mut out).unwrap();
        assert_eq!(out, src);
        assert_eq!(ct, "image/png");
    }

    #[test]
    fn resolve_dimensions_cases() {
        let o = |w, h| Options {
            width: w,
            height: h,
            ..Options::default()
        };
        // absolute pixels
        assert_eq!(resolve_dimensions(100, 50, &o(30.0, 20.0)), (30, 20));
        // fractions of the source
        assert_eq!(resolve_dimensions(100, 50, &o(0.5, 0.5)), (50, 25));
        // negatives are ignored
        assert_eq!(resolve_dimensions(100, 50, &o(-1.0, -2.0)), (0, 0));
        // never enlarge beyond the original
        assert_eq!(resolve_dimensions(100, 50, &o(400.0, 400.0)), (100, 50));
    }

    #[test]
    fn thumbnail_fills_and_crops() {
        let src = sample_png(100, 50);
        assert_eq!(transformed_dims(&src, "10x10"), (10, 10));
    }

    #[test]
    fn fit_preserves_aspect() {
        let src = sample_png(100, 50);
        assert_eq!(transformed_dims(&src, "10x10,fit"), (10, 5));
    }

    #[test]
    fn single_axis_is_proportional() {
        let src = sample_png(100, 50);
        assert_eq!(transformed_dims(&src, "x25"), (50, 25));
        assert_eq!(transformed_dims(&src, "50x"), (50, 25));
    }

    #[test]
    fn fractional_width_scales_source() {
        let src = sample_png(100, 50);
        assert_eq!(transformed_dims(&src, "0.5x"), (50, 25));
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let src = sample_png(100, 50);
        assert_eq!(transformed_dims(&src, "100x50,r90"), (50, 100));
        // angles outside {90,180,270} are noops
        assert_eq!(transformed_dims(&src, "100x50,r45"), (100, 50));
    }

    #[test]
    fn output_format_follows_input() {
        let src = sample_png(8, 8);
        let mut out = Vec::new();
        let ct = transform_bytes(&src, &Options::parse("4x4"), &mut out).unwrap();
        assert_eq!(ct, "image/png");
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn garbage_input_is_a_decode_error() {
        let mut out = Vec::new();
        let err = transform_bytes(b"not an image", &Options::parse("4x4"), &mut out);
        assert!(matches!(err, Err(crate::error::SharaqError::Decode(_))));
    }

    #[test]
    fn sniffs_stored_formats() {
        assert_eq!(sniff_content_type(&sample_png(2, 2)), "image/png");
        assert_eq!(sniff_content_type(&[0xff, 0xd8, 0xff]), "image/jpeg");
        assert_eq!(sniff_content_type(b"GIF89a"), "image/gif");
        assert_eq!(sniff_content_type(b"plain"), "application/octet-stream");
    }
}
