//! The slash-separated operation grammar.
//!
//! Segments appear in a strict order, each optional, presence detected
//! by pattern:
//!
//! `[meta] [trim] [AxB:CxD crop] [fit-in] [stretch] [WxH] [LxT:RxB pad]
//!  [halign] [valign] [smart] [filters:...] blob/<key> | url/<encoded>`
//!
//! `parse` and `to_path` are inverses for canonical parameter values.

use std::fmt::Write as _;

use crate::filters::Filter;

/// Grammar errors; mapped to bad-request by the HTTP adapter.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// A segment failed to parse where one was required.
    #[error("malformed operation path: {0}")]
    Malformed(String),
    /// No source segment at the end of the path.
    #[error("missing source")]
    MissingSource,
}

/// Where the source bytes come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Source {
    /// A key in the blob store.
    Blob(String),
    /// A percent-encoded remote URL.
    Url(String),
}

/// A crop or padding coordinate: absolute pixels or percent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dim {
    /// Absolute pixel value.
    Px(u32),
    /// Percentage of the relevant source dimension.
    Pct(u32),
}

impl Dim {
    /// Resolve against a concrete dimension.
    pub fn resolve(self, against: u32) -> u32 {
        match self {
            Self::Px(v) => v,
            Self::Pct(p) => (u64::from(against) * u64::from(p) / 100) as u32,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.strip_suffix('%') {
            Some(p) => p.parse().ok().map(Self::Pct),
            None => s.parse().ok().map(Self::Px),
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Px(v) => write!(f, "{v}"),
            Self::Pct(p) => write!(f, "{p}%"),
        }
    }
}

/// Manual crop rectangle `(x1,y1)-(x2,y2)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CropSpec {
    /// Left edge.
    pub x1: Dim,
    /// Top edge.
    pub y1: Dim,
    /// Right edge (exclusive).
    pub x2: Dim,
    /// Bottom edge (exclusive).
    pub y2: Dim,
}

/// Padding in pixels per side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PadSpec {
    /// Left padding.
    pub left: u32,
    /// Top padding.
    pub top: u32,
    /// Right padding.
    pub right: u32,
    /// Bottom padding.
    pub bottom: u32,
}

/// Horizontal crop alignment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HAlign {
    /// Keep the left edge.
    Left,
    /// Keep the middle (default).
    #[default]
    Center,
    /// Keep the right edge.
    Right,
}

/// Vertical crop alignment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum VAlign {
    /// Keep the top edge.
    Top,
    /// Keep the middle (default).
    #[default]
    Middle,
    /// Keep the bottom edge.
    Bottom,
}

/// Parsed operation parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Params {
    /// Return JSON metadata instead of image bytes.
    pub meta: bool,
    /// Remove uniform borders (reference: top-left pixel).
    pub trim: bool,
    /// Manual crop applied before sizing.
    pub crop: Option<CropSpec>,
    /// Constrain-inside sizing.
    pub fit_in: bool,
    /// Non-proportional sizing.
    pub stretch: bool,
    /// Target width; `0` derives from the aspect ratio.
    pub width: u32,
    /// Target height; `0` derives from the aspect ratio.
    pub height: u32,
    /// Mirror horizontally.
    pub flip_h: bool,
    /// Mirror vertically.
    pub flip_v: bool,
    /// Canvas padding applied after sizing.
    pub padding: Option<PadSpec>,
    /// Horizontal alignment for cover crops.
    pub h_align: HAlign,
    /// Vertical alignment for cover crops.
    pub v_align: VAlign,
    /// Use focal-point detection for cover crops.
    pub smart: bool,
    /// Filter chain, applied in order.
    pub filters: Vec<Filter>,
    /// Source of the bytes to transform.
    pub source: Source,
}

impl Params {
    /// Parse a full operation path (signature already stripped).
    pub fn parse(path: &str) -> Result<Self, ParseError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = path.split('/').collect();
        let mut i = 0usize;

        let meta = at(&segments, &mut i, "meta");
        let trim = at(&segments, &mut i, "trim");
        let crop = take(&segments, &mut i, parse_rect).map(|(x1, y1, x2, y2)| CropSpec {
            x1,
            y1,
            x2,
            y2,
        });
        let fit_in = at(&segments, &mut i, "fit-in");
        let stretch = at(&segments, &mut i, "stretch");
        let dims = take(&segments, &mut i, parse_dims);
        let (width, flip_h, height, flip_v) = dims.unwrap_or((0, false, 0, false));
        let padding = take(&segments, &mut i, parse_pad);
        let h_align = take(&segments, &mut i, parse_halign).unwrap_or_default();
        let v_align = take(&segments, &mut i, parse_valign).unwrap_or_default();
        let smart = at(&segments, &mut i, "smart");
        let filters = match segments.get(i).and_then(|s| s.strip_prefix("filters:")) {
            Some(chain) => {
                i += 1;
                Filter::parse_chain(chain)?
            }
            None => Vec::new(),
        };

        let source = match segments.get(i) {
            Some(&"blob") => {
                let key = segments[i + 1..].join("/");
                if key.is_empty() {
                    return Err(ParseError::Malformed("empty blob key".to_string()));
                }
                Source::Blob(key)
            }
            Some(&"url") => {
                let target = segments[i + 1..].join("/");
                if target.is_empty() {
                    return Err(ParseError::Malformed("empty url source".to_string()));
                }
                Source::Url(target)
            }
            Some(other) => {
                return Err(ParseError::Malformed(format!("unknown segment `{other}`")))
            }
            None => return Err(ParseError::MissingSource),
        };

        Ok(Self {
            meta,
            trim,
            crop,
            fit_in,
            stretch,
            width,
            height,
            flip_h,
            flip_v,
            padding,
            h_align,
            v_align,
            smart,
            filters,
            source,
        })
    }

    /// Render the canonical path for these parameters; the inverse of
    /// [`Params::parse`], also used as the cache normalization key.
    pub fn to_path(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.meta {
            parts.push("meta".to_string());
        }
        if self.trim {
            parts.push("trim".to_string());
        }
        if let Some(c) = &self.crop {
            parts.push(format!("{}x{}:{}x{}", c.x1, c.y1, c.x2, c.y2));
        }
        if self.fit_in {
            parts.push("fit-in".to_string());
        }
        if self.stretch {
            parts.push("stretch".to_string());
        }
        if self.has_dims() {
            let mut s = String::new();
            if self.flip_h {
                s.push('-');
            }
            let _ = write!(s, "{}x", self.width);
            if self.flip_v {
                s.push('-');
            }
            let _ = write!(s, "{}", self.height);
            parts.push(s);
        }
        if let Some(p) = &self.padding {
            parts.push(format!("{}x{}:{}x{}", p.left, p.top, p.right, p.bottom));
        }
        if self.h_align != HAlign::Center {
            parts.push(halign_name(self.h_align).to_string());
        }
        if self.v_align != VAlign::Middle {
            parts.push(valign_name(self.v_align).to_string());
        }
        if self.smart {
            parts.push("smart".to_string());
        }
        if !self.filters.is_empty() {
            let chain =
                self.filters.iter().map(ToString::to_string).collect::<Vec<_>>().join(":");
            parts.push(format!("filters:{chain}"));
        }
        match &self.source {
            Source::Blob(key) => parts.push(format!("blob/{key}")),
            Source::Url(target) => parts.push(format!("url/{target}")),
        }
        parts.join("/")
    }

    /// Whether a dimensions segment is emitted. Padding needs one in
    /// front of it so the pad rectangle is not read as a crop.
    fn has_dims(&self) -> bool {
        self.width != 0
            || self.height != 0
            || self.flip_h
            || self.flip_v
            || self.padding.is_some()
    }
}

fn at(segments: &[&str], i: &mut usize, expect: &str) -> bool {
    if segments.get(*i) == Some(&expect) {
        *i += 1;
        true
    } else {
        false
    }
}

fn take<T>(segments: &[&str], i: &mut usize, f: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = segments.get(*i).and_then(|s| f(s));
    if parsed.is_some() {
        *i += 1;
    }
    parsed
}

fn parse_rect(s: &str) -> Option<(Dim, Dim, Dim, Dim)> {
    let (tl, br) = s.split_once(':')?;
    let (x1, y1) = tl.split_once('x')?;
    let (x2, y2) = br.split_once('x')?;
    Some((Dim::parse(x1)?, Dim::parse(y1)?, Dim::parse(x2)?, Dim::parse(y2)?))
}

fn parse_pad(s: &str) -> Option<PadSpec> {
    let (tl, br) = s.split_once(':')?;
    let (l, t) = tl.split_once('x')?;
    let (r, b) = br.split_once('x')?;
    Some(PadSpec {
        left: l.parse().ok()?,
        top: t.parse().ok()?,
        right: r.parse().ok()?,
        bottom: b.parse().ok()?,
    })
}

fn parse_dims(s: &str) -> Option<(u32, bool, u32, bool)> {
    if s.contains(':') {
        return None;
    }
    let (w, h) = s.split_once('x')?;
    let (width, flip_h) = parse_axis(w)?;
    let (height, flip_v) = parse_axis(h)?;
    Some((width, flip_h, height, flip_v))
}

fn parse_axis(s: &str) -> Option<(u32, bool)> {
    let (flip, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() {
        return Some((0, flip));
    }
    digits.parse().ok().map(|v| (v, flip))
}

fn parse_halign(s: &str) -> Option<HAlign> {
    match s {
        "left" => Some(HAlign::Left),
        "center" => Some(HAlign::Center),
        "right" => Some(HAlign::Right),
        _ => None,
    }
}

fn parse_valign(s: &str) -> Option<VAlign> {
    match s {
        "top" => Some(VAlign::Top),
        "middle" => Some(VAlign::Middle),
        "bottom" => Some(VAlign::Bottom),
        _ => None,
    }
}

fn halign_name(h: HAlign) -> &'static str {
    match h {
        HAlign::Left => "left",
        HAlign::Center => "center",
        HAlign::Right => "right",
    }
}

fn valign_name(v: VAlign) -> &'static str {
    match v {
        VAlign::Top => "top",
        VAlign::Middle => "middle",
        VAlign::Bottom => "bottom",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::OutputFormat;
    use proptest::prelude::*;

    fn parse(path: &str) -> Params {
        Params::parse(path).unwrap()
    }

    #[test]
    fn minimal_blob_path() {
        let p = parse("blob/a/b.jpg");
        assert_eq!(p.source, Source::Blob("a/b.jpg".to_string()));
        assert!(!p.trim && !p.fit_in && !p.stretch && !p.smart && !p.meta);
        assert_eq!((p.width, p.height), (0, 0));
    }

    #[test]
    fn full_ordering() {
        let p = parse(
            "meta/trim/10x10:90%x90%/fit-in/-300x-200/5x5:5x5/left/bottom/smart/filters:quality(80):format(webp)/blob/pics/cat.png",
        );
        assert!(p.meta && p.trim && p.fit_in && p.smart);
        assert_eq!(
            p.crop,
            Some(CropSpec {
                x1: Dim::Px(10),
                y1: Dim::Px(10),
                x2: Dim::Pct(90),
                y2: Dim::Pct(90)
            })
        );
        assert_eq!((p.width, p.height), (300, 200));
        assert!(p.flip_h && p.flip_v);
        assert_eq!(p.padding, Some(PadSpec { left: 5, top: 5, right: 5, bottom: 5 }));
        assert_eq!(p.h_align, HAlign::Left);
        assert_eq!(p.v_align, VAlign::Bottom);
        assert_eq!(Filter::format_of(&p.filters), Some(OutputFormat::Webp));
        assert_eq!(p.source, Source::Blob("pics/cat.png".to_string()));
    }

    #[test]
    fn dims_allow_partial_axes() {
        assert_eq!(parse("100x/blob/k").width, 100);
        assert_eq!(parse("100x/blob/k").height, 0);
        assert_eq!(parse("x100/blob/k").height, 100);
        let flipped = parse("-x-/blob/k");
        assert!(flipped.flip_h && flipped.flip_v);
        assert_eq!((flipped.width, flipped.height), (0, 0));
    }

    #[test]
    fn first_rect_is_crop_second_is_padding() {
        let p = parse("1x2:3x4/0x0/5x6:7x8/blob/k");
        assert_eq!(
            p.crop,
            Some(CropSpec { x1: Dim::Px(1), y1: Dim::Px(2), x2: Dim::Px(3), y2: Dim::Px(4) })
        );
        assert_eq!(p.padding, Some(PadSpec { left: 5, top: 6, right: 7, bottom: 8 }));
    }

    #[test]
    fn url_source_keeps_remainder() {
        let p = parse("200x0/url/https%3A%2F%2Fcdn.example.com%2Fcat.jpg");
        assert_eq!(p.source, Source::Url("https%3A%2F%2Fcdn.example.com%2Fcat.jpg".to_string()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Params::parse("").is_err());
        assert!(Params::parse("100x100").is_err());
        assert!(Params::parse("blob/").is_err());
        assert!(Params::parse("bogus-op/blob/k").is_err());
        assert!(Params::parse("100x100/filters:nope(1)/blob/k").is_err());
    }

    #[test]
    fn to_path_is_canonical() {
        let path = "trim/fit-in/100x200/filters:quality(80)/blob/a/b.jpg";
        assert_eq!(parse(path).to_path(), path);
        // defaults are omitted
        assert_eq!(parse("center/middle/blob/k").to_path(), "blob/k");
    }

    fn arb_dim() -> impl Strategy<Value = Dim> {
        prop_oneof![(0u32..500).prop_map(Dim::Px), (0u32..100).prop_map(Dim::Pct)]
    }

    fn arb_filters() -> impl Strategy<Value = Vec<Filter>> {
        proptest::collection::vec(
            prop_oneof![
                (0u8..=100).prop_map(Filter::Quality),
                (-100i16..=100).prop_map(Filter::Contrast),
                (0u32..60).prop_map(|v| Filter::Blur(v as f32 / 2.0)),
                Just(Filter::Grayscale),
                Just(Filter::Upscale),
                (1u32..50, 1u32..50).prop_map(|(rx, ry)| Filter::RoundCorner { rx, ry }),
            ],
            0..4,
        )
    }

    fn arb_params() -> impl Strategy<Value = Params> {
        (
            (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()),
            proptest::option::of((arb_dim(), arb_dim(), arb_dim(), arb_dim())),
            (0u32..2000, 0u32..2000, any::<bool>(), any::<bool>()),
            proptest::option::of((0u32..20, 0u32..20, 0u32..20, 0u32..20)),
            (0usize..3, 0usize..3),
            arb_filters(),
            "[a-z]{1,8}(/[a-z]{1,8}){0,2}",
        )
            .prop_map(
                |(
                    (meta, trim, fit_in, stretch, smart),
                    crop,
                    (width, height, flip_h, flip_v),
                    padding,
                    (ha, va),
                    filters,
                    key,
                )| {
                    Params {
                        meta,
                        trim,
                        crop: crop.map(|(x1, y1, x2, y2)| CropSpec { x1, y1, x2, y2 }),
                        fit_in,
                        stretch,
                        width,
                        height,
                        flip_h,
                        flip_v,
                        padding: padding.map(|(left, top, right, bottom)| PadSpec {
                            left,
                            top,
                            right,
                            bottom,
                        }),
                        h_align: [HAlign::Left, HAlign::Center, HAlign::Right][ha],
                        v_align: [VAlign::Top, VAlign::Middle, VAlign::Bottom][va],
                        smart,
                        filters,
                        source: Source::Blob(key),
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn parse_format_round_trip(params in arb_params()) {
            let path = params.to_path();
            prop_assert_eq!(Params::parse(&path).unwrap(), params);
        }
    }
}
