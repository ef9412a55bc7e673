//! Pixel work: decode, operation chain, encode.
//!
//! Everything here is CPU-bound and synchronous; the engine runs it on
//! the blocking pool. Operation order: trim, manual crop, sizing,
//! flips, padding, then the filter chain in request order.

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

use crate::filters::{Filter, FocalRegion, OutputFormat};
use crate::params::{CropSpec, HAlign, Params, VAlign};
use crate::Error;

const DEFAULT_QUALITY: u8 = 80;
const AVIF_SPEED: u8 = 6;

/// A fully transformed, encoded image.
#[derive(Debug)]
pub struct Processed {
    /// Encoded bytes.
    pub body: Vec<u8>,
    /// Format the bytes are encoded in.
    pub format: OutputFormat,
    /// Final pixel width.
    pub width: u32,
    /// Final pixel height.
    pub height: u32,
}

/// Run the whole chain over `bytes`. `prefer` is the Accept-negotiated
/// output format; the filter chain and then the source format are the
/// fallbacks.
pub fn process(params: &Params, bytes: &[u8], prefer: Option<OutputFormat>) -> Result<Processed, Error> {
    let source_format = image::guess_format(bytes).ok().and_then(from_image_format);
    let mut img = decode(bytes)?;

    if params.trim {
        img = trim_uniform_border(&img);
    }
    if let Some(crop) = &params.crop {
        img = manual_crop(&img, crop)?;
    }
    img = resize(params, img);
    if params.flip_h {
        img = img.fliph();
    }
    if params.flip_v {
        img = img.flipv();
    }
    if let Some(pad) = &params.padding {
        img = pad_canvas(&img, pad.left, pad.top, pad.right, pad.bottom);
    }
    for filter in &params.filters {
        img = apply_filter(&img, filter);
    }

    let format = prefer
        .or_else(|| Filter::format_of(&params.filters))
        .or(source_format)
        .unwrap_or(OutputFormat::Png);
    let quality = Filter::quality_of(&params.filters).unwrap_or(DEFAULT_QUALITY);
    let (width, height) = img.dimensions();
    let body = encode(&img, format, quality)?;
    Ok(Processed { body, format, width, height })
}

/// Decode and report dimensions without transforming.
pub fn probe(bytes: &[u8]) -> Result<(u32, u32), Error> {
    let img = decode(bytes)?;
    Ok(img.dimensions())
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, Error> {
    image::load_from_memory(bytes).map_err(|e| match e {
        image::ImageError::Unsupported(u) => Error::UnsupportedMediaType(u.to_string()),
        image::ImageError::Decoding(d) => Error::UnsupportedMediaType(d.to_string()),
        other => Error::Codec(other.to_string()),
    })
}

fn from_image_format(f: ImageFormat) -> Option<OutputFormat> {
    match f {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::WebP => Some(OutputFormat::Webp),
        ImageFormat::Avif => Some(OutputFormat::Avif),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        ImageFormat::Tiff => Some(OutputFormat::Tiff),
        _ => None,
    }
}

fn trim_uniform_border(img: &DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let reference = *rgba.get_pixel(0, 0);
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0u32, 0u32);
    let mut any = false;
    for (x, y, p) in rgba.enumerate_pixels() {
        if *p != reference {
            any = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if !any {
        return img.clone();
    }
    img.crop_imm(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

fn manual_crop(img: &DynamicImage, crop: &CropSpec) -> Result<DynamicImage, Error> {
    let (w, h) = img.dimensions();
    let x1 = crop.x1.resolve(w).min(w);
    let y1 = crop.y1.resolve(h).min(h);
    let x2 = crop.x2.resolve(w).min(w);
    let y2 = crop.y2.resolve(h).min(h);
    if x2 <= x1 || y2 <= y1 {
        return Err(Error::BadRequest("empty crop rectangle".to_string()));
    }
    Ok(img.crop_imm(x1, y1, x2 - x1, y2 - y1))
}

fn resize(params: &Params, img: DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    let (tw, th) = (params.width, params.height);
    if tw == 0 && th == 0 {
        return img;
    }
    let upscale = params.filters.contains(&Filter::Upscale);

    if params.stretch && tw > 0 && th > 0 {
        return img.resize_exact(tw, th, FilterType::Lanczos3);
    }
    if params.fit_in {
        let mut scale = f64::INFINITY;
        if tw > 0 {
            scale = scale.min(f64::from(tw) / f64::from(w));
        }
        if th > 0 {
            scale = scale.min(f64::from(th) / f64::from(h));
        }
        if !upscale {
            scale = scale.min(1.0);
        }
        return scale_by(&img, scale);
    }
    // default: cover the requested box, then crop to it
    if tw == 0 || th == 0 {
        let scale = if tw > 0 {
            f64::from(tw) / f64::from(w)
        } else {
            f64::from(th) / f64::from(h)
        };
        return scale_by(&img, scale);
    }
    let scale = (f64::from(tw) / f64::from(w)).max(f64::from(th) / f64::from(h));
    let covered = scale_by(&img, scale);
    cover_crop(&covered, tw, th, params, scale)
}

fn scale_by(img: &DynamicImage, scale: f64) -> DynamicImage {
    if scale == 1.0 || !scale.is_finite() {
        return img.clone();
    }
    let (w, h) = img.dimensions();
    let nw = ((f64::from(w) * scale).round() as u32).max(1);
    let nh = ((f64::from(h) * scale).round() as u32).max(1);
    img.resize_exact(nw, nh, FilterType::Lanczos3)
}

fn cover_crop(
    img: &DynamicImage,
    tw: u32,
    th: u32,
    params: &Params,
    scale: f64,
) -> DynamicImage {
    let (w, h) = img.dimensions();
    let tw = tw.min(w);
    let th = th.min(h);
    let focal = if params.smart { Filter::focal_of(&params.filters) } else { None };
    let x = match focal {
        Some(region) => focal_offset(&region, scale, w, tw, true),
        None => match params.h_align {
            HAlign::Left => 0,
            HAlign::Center => (w - tw) / 2,
            HAlign::Right => w - tw,
        },
    };
    let y = match focal {
        Some(region) => focal_offset(&region, scale, h, th, false),
        None => match params.v_align {
            VAlign::Top => 0,
            VAlign::Middle => (h - th) / 2,
            VAlign::Bottom => h - th,
        },
    };
    img.crop_imm(x, y, tw, th)
}

/// Window offset that centers the (scaled) focal region, clamped to
/// the image bounds.
fn focal_offset(region: &FocalRegion, scale: f64, full: u32, window: u32, horizontal: bool) -> u32 {
    let (lo, hi) = if horizontal {
        (region.left, region.right)
    } else {
        (region.top, region.bottom)
    };
    let center = f64::from(lo + hi) / 2.0 * scale;
    let half = f64::from(window) / 2.0;
    let offset = (center - half).max(0.0) as u32;
    offset.min(full - window)
}

fn pad_canvas(img: &DynamicImage, left: u32, top: u32, right: u32, bottom: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let mut canvas =
        RgbaImage::from_pixel(w + left + right, h + top + bottom, Rgba([255, 255, 255, 255]));
    image::imageops::overlay(&mut canvas, &img.to_rgba8(), i64::from(left), i64::from(top));
    DynamicImage::ImageRgba8(canvas)
}

fn apply_filter(img: &DynamicImage, filter: &Filter) -> DynamicImage {
    match filter {
        Filter::Brightness(v) => img.brighten(i32::from(*v)),
        Filter::Contrast(v) => img.adjust_contrast(f32::from(*v)),
        Filter::Blur(sigma) if *sigma > 0.0 => img.blur(*sigma),
        Filter::Rgb(r, g, b) => rgb_shift(img, *r, *g, *b),
        Filter::RoundCorner { rx, ry } => round_corners(img, *rx, *ry),
        Filter::Grayscale => DynamicImage::ImageRgba8(img.grayscale().to_rgba8()),
        Filter::Proportion(p) if *p > 0.0 => scale_by(img, f64::from(*p)),
        // quality/format steer the encoder; focal steers cover crops;
        // strip_* hold because re-encoding never carries metadata over
        _ => img.clone(),
    }
}

fn rgb_shift(img: &DynamicImage, dr: i16, dg: i16, db: i16) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    for p in rgba.pixels_mut() {
        p.0[0] = shift(p.0[0], dr);
        p.0[1] = shift(p.0[1], dg);
        p.0[2] = shift(p.0[2], db);
    }
    DynamicImage::ImageRgba8(rgba)
}

fn shift(v: u8, d: i16) -> u8 {
    (i16::from(v) + d).clamp(0, 255) as u8
}

fn round_corners(img: &DynamicImage, rx: u32, ry: u32) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let rx = rx.min(w / 2).max(1);
    let ry = ry.min(h / 2).max(1);
    for (x, y, p) in rgba.enumerate_pixels_mut() {
        let cx = if x < rx {
            Some(rx - 1 - x)
        } else if x >= w - rx {
            Some(x - (w - rx))
        } else {
            None
        };
        let cy = if y < ry {
            Some(ry - 1 - y)
        } else if y >= h - ry {
            Some(y - (h - ry))
        } else {
            None
        };
        if let (Some(dx), Some(dy)) = (cx, cy) {
            let nx = f64::from(dx) / f64::from(rx);
            let ny = f64::from(dy) / f64::from(ry);
            if nx * nx + ny * ny > 1.0 {
                p.0[3] = 0;
            }
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, Error> {
    let mut buf = Cursor::new(Vec::new());
    let result = match format {
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
        }
        OutputFormat::Png => img.write_to(&mut buf, ImageFormat::Png),
        OutputFormat::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut buf))
        }
        OutputFormat::Avif => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(AvifEncoder::new_with_speed_quality(
                &mut buf, AVIF_SPEED, quality,
            ))
        }
        OutputFormat::Gif => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut buf, ImageFormat::Gif)
        }
        OutputFormat::Tiff => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut buf, ImageFormat::Tiff)
        }
    };
    result.map_err(|e| Error::Codec(e.to_string()))?;
    Ok(buf.into_inner())
}
