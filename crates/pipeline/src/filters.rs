//! Named filter chain: parsing, formatting, and the closed filter set.
//!
//! Filters arrive as `filters:name(args):name(args):...`. Parsing
//! dispatches by name into a typed variant; adding a filter extends
//! the enum. Formatting is the exact inverse so canonical chains
//! round-trip.

use std::fmt;

use crate::params::ParseError;

/// Output image formats the encoder can produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    /// JPEG (lossy; honors the quality filter).
    Jpeg,
    /// PNG (lossless).
    Png,
    /// WebP (lossless encoder).
    Webp,
    /// AVIF (lossy; honors the quality filter).
    Avif,
    /// GIF.
    Gif,
    /// TIFF.
    Tiff,
}

impl OutputFormat {
    /// Lowercase name used in `format(...)` filters.
    pub fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
        }
    }

    /// MIME type for response headers.
    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Gif => "image/gif",
            Self::Tiff => "image/tiff",
        }
    }

    /// Parse a `format(...)` argument. `jpg` is accepted for JPEG.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "gif" => Some(Self::Gif),
            "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }
}

/// A rectangular focal region in source pixel coordinates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FocalRegion {
    /// Left edge.
    pub left: u32,
    /// Top edge.
    pub top: u32,
    /// Right edge (exclusive).
    pub right: u32,
    /// Bottom edge (exclusive).
    pub bottom: u32,
}

/// One filter in the chain.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Encode quality 0–100 (lossy formats).
    Quality(u8),
    /// Additive brightness, -255..=255.
    Brightness(i16),
    /// Contrast adjustment, -100..=100.
    Contrast(i16),
    /// Force the output format.
    Format(OutputFormat),
    /// Gaussian blur with the given sigma.
    Blur(f32),
    /// Per-channel additive shift.
    Rgb(i16, i16, i16),
    /// Rounded corners with x/y radii; outside becomes transparent.
    RoundCorner {
        /// Horizontal radius.
        rx: u32,
        /// Vertical radius.
        ry: u32,
    },
    /// Focal region steering smart crops.
    Focal(FocalRegion),
    /// Convert to grayscale.
    Grayscale,
    /// Allow fit-in to scale images up.
    Upscale,
    /// Scale both dimensions by a factor.
    Proportion(f32),
    /// Drop EXIF metadata from the output.
    StripExif,
    /// Drop ICC profile from the output.
    StripIcc,
    /// Drop all ancillary metadata from the output.
    StripMetadata,
}

impl Filter {
    /// Parse a `filters:...` segment (with the `filters:` prefix
    /// already removed) into a chain.
    pub fn parse_chain(chain: &str) -> Result<Vec<Self>, ParseError> {
        if chain.is_empty() {
            return Ok(Vec::new());
        }
        split_chain(chain).iter().map(|part| Self::parse_one(part)).collect()
    }

    fn parse_one(part: &str) -> Result<Self, ParseError> {
        let (name, args) = match part.split_once('(') {
            Some((name, rest)) => {
                let args =
                    rest.strip_suffix(')').ok_or_else(|| bad(format!("filter `{part}`")))?;
                (name, args)
            }
            None => (part, ""),
        };
        let filter = match name {
            "quality" => Self::Quality(parse_arg(name, args)?),
            "brightness" => Self::Brightness(parse_arg(name, args)?),
            "contrast" => Self::Contrast(parse_arg(name, args)?),
            "format" => Self::Format(
                OutputFormat::from_name(args)
                    .ok_or_else(|| bad(format!("unknown format `{args}`")))?,
            ),
            "blur" => Self::Blur(parse_arg(name, args)?),
            "rgb" => {
                let mut it = args.split(',');
                let r = parse_arg(name, it.next().unwrap_or(""))?;
                let g = parse_arg(name, it.next().unwrap_or(""))?;
                let b = parse_arg(name, it.next().unwrap_or(""))?;
                if it.next().is_some() {
                    return Err(bad("rgb takes three arguments".to_string()));
                }
                Self::Rgb(r, g, b)
            }
            "round_corner" => {
                let mut it = args.split(',');
                let rx = parse_arg(name, it.next().unwrap_or(""))?;
                let ry = match it.next() {
                    Some(s) => parse_arg(name, s)?,
                    None => rx,
                };
                if it.next().is_some() {
                    return Err(bad("round_corner takes at most two arguments".to_string()));
                }
                Self::RoundCorner { rx, ry }
            }
            "focal" => Self::Focal(parse_focal(args)?),
            "grayscale" => Self::Grayscale,
            "upscale" => Self::Upscale,
            "proportion" => Self::Proportion(parse_arg(name, args)?),
            "strip_exif" => Self::StripExif,
            "strip_icc" => Self::StripIcc,
            "strip_metadata" => Self::StripMetadata,
            other => return Err(bad(format!("unknown filter `{other}`"))),
        };
        Ok(filter)
    }

    /// Quality carried by this chain, if any.
    pub fn quality_of(chain: &[Self]) -> Option<u8> {
        chain.iter().find_map(|f| match f {
            Self::Quality(q) => Some(*q),
            _ => None,
        })
    }

    /// Forced output format carried by this chain, if any.
    pub fn format_of(chain: &[Self]) -> Option<OutputFormat> {
        chain.iter().find_map(|f| match f {
            Self::Format(fmt) => Some(*fmt),
            _ => None,
        })
    }

    /// Focal region carried by this chain, if any.
    pub fn focal_of(chain: &[Self]) -> Option<FocalRegion> {
        chain.iter().find_map(|f| match f {
            Self::Focal(r) => Some(*r),
            _ => None,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quality(q) => write!(f, "quality({q})"),
            Self::Brightness(v) => write!(f, "brightness({v})"),
            Self::Contrast(v) => write!(f, "contrast({v})"),
            Self::Format(fmt) => write!(f, "format({})", fmt.name()),
            Self::Blur(sigma) => write!(f, "blur({sigma})"),
            Self::Rgb(r, g, b) => write!(f, "rgb({r},{g},{b})"),
            Self::RoundCorner { rx, ry } if rx == ry => write!(f, "round_corner({rx})"),
            Self::RoundCorner { rx, ry } => write!(f, "round_corner({rx},{ry})"),
            Self::Focal(r) => {
                write!(f, "focal({}x{}:{}x{})", r.left, r.top, r.right, r.bottom)
            }
            Self::Grayscale => write!(f, "grayscale()"),
            Self::Upscale => write!(f, "upscale()"),
            Self::Proportion(p) => write!(f, "proportion({p})"),
            Self::StripExif => write!(f, "strip_exif()"),
            Self::StripIcc => write!(f, "strip_icc()"),
            Self::StripMetadata => write!(f, "strip_metadata()"),
        }
    }
}

/// Split a chain on `:` while respecting parenthesized arguments,
/// which may themselves contain `:` (focal regions).
fn split_chain(chain: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in chain.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                parts.push(&chain[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&chain[start..]);
    parts
}

fn parse_focal(args: &str) -> Result<FocalRegion, ParseError> {
    let (tl, br) = args.split_once(':').ok_or_else(|| bad("focal region".to_string()))?;
    let (left, top) = parse_point(tl)?;
    let (right, bottom) = parse_point(br)?;
    if right <= left || bottom <= top {
        return Err(bad("empty focal region".to_string()));
    }
    Ok(FocalRegion { left, top, right, bottom })
}

fn parse_point(s: &str) -> Result<(u32, u32), ParseError> {
    let (x, y) = s.split_once('x').ok_or_else(|| bad("focal point".to_string()))?;
    Ok((parse_arg("focal", x)?, parse_arg("focal", y)?))
}

fn parse_arg<T: std::str::FromStr>(filter: &str, raw: &str) -> Result<T, ParseError> {
    raw.parse().map_err(|_| bad(format!("argument `{raw}` of {filter}")))
}

fn bad(what: String) -> ParseError {
    ParseError::Malformed(what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_mixed_chain() {
        let chain =
            Filter::parse_chain("quality(80):blur(2.5):rgb(10,-5,0):focal(1x2:30x40)").unwrap();
        assert_eq!(
            chain,
            vec![
                Filter::Quality(80),
                Filter::Blur(2.5),
                Filter::Rgb(10, -5, 0),
                Filter::Focal(FocalRegion { left: 1, top: 2, right: 30, bottom: 40 }),
            ]
        );
    }

    #[test]
    fn display_round_trips() {
        let filters = vec![
            Filter::Quality(85),
            Filter::Brightness(-20),
            Filter::Contrast(15),
            Filter::Format(OutputFormat::Webp),
            Filter::Blur(1.5),
            Filter::Rgb(1, 2, 3),
            Filter::RoundCorner { rx: 20, ry: 20 },
            Filter::RoundCorner { rx: 20, ry: 10 },
            Filter::Focal(FocalRegion { left: 0, top: 0, right: 10, bottom: 10 }),
            Filter::Grayscale,
            Filter::Upscale,
            Filter::Proportion(0.5),
            Filter::StripExif,
            Filter::StripIcc,
            Filter::StripMetadata,
        ];
        let joined = filters.iter().map(ToString::to_string).collect::<Vec<_>>().join(":");
        assert_eq!(Filter::parse_chain(&joined).unwrap(), filters);
    }

    #[test]
    fn unknown_names_and_bad_args_fail() {
        assert!(Filter::parse_chain("sharpen(1)").is_err());
        assert!(Filter::parse_chain("quality(loud)").is_err());
        assert!(Filter::parse_chain("quality(80").is_err());
        assert!(Filter::parse_chain("rgb(1,2)").is_err());
        assert!(Filter::parse_chain("focal(10x10:5x5)").is_err());
        assert!(Filter::parse_chain("format(bmp)").is_err());
    }

    #[test]
    fn chain_accessors() {
        let chain = Filter::parse_chain("quality(70):format(avif)").unwrap();
        assert_eq!(Filter::quality_of(&chain), Some(70));
        assert_eq!(Filter::format_of(&chain), Some(OutputFormat::Avif));
        assert_eq!(Filter::focal_of(&chain), None);
    }
}
