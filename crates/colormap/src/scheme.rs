//! Color schemes and multi-stop interpolation.

/// RGB color with channels in 0..=255.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// A color stop: position in [0, 1] mapped to an RGB color.
#[derive(Debug, Clone, Copy)]
pub struct ColorStop {
    pub t: f64,
    pub color: Rgb,
}

impl ColorStop {
    pub const fn new(t: f64, r: u8, g: u8, b: u8) -> Self {
        Self {
            t,
            color: Rgb::new(r, g, b),
        }
    }
}

/// Available color schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorScheme {
    /// Black -> White
    #[default]
    Grayscale,
    /// Brown -> Yellow -> Green
    Ndvi,
    /// Red -> Yellow -> Green, for index change between runs
    RedYellowGreen,
}

impl ColorScheme {
    pub const ALL: &[ColorScheme] = &[Self::Grayscale, Self::Ndvi, Self::RedYellowGreen];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Grayscale => "grayscale",
            Self::Ndvi => "ndvi",
            Self::RedYellowGreen => "rdylgn",
        }
    }

    /// Parse a scheme by its [`name`](Self::name), case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// Stops
// ---------------------------------------------------------------------------

const NDVI_STOPS: &[ColorStop] = &[
    ColorStop::new(0.0, 120, 70, 20),
    ColorStop::new(0.3, 200, 170, 60),
    ColorStop::new(0.5, 240, 230, 100),
    ColorStop::new(0.7, 100, 180, 50),
    ColorStop::new(1.0, 10, 100, 20),
];

const RDYLGN_STOPS: &[ColorStop] = &[
    ColorStop::new(0.00, 165, 0, 38),
    ColorStop::new(0.25, 244, 109, 67),
    ColorStop::new(0.50, 255, 255, 191),
    ColorStop::new(0.75, 102, 189, 99),
    ColorStop::new(1.00, 0, 104, 55),
];

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn lerp_color(c1: Rgb, c2: Rgb, t: f64) -> Rgb {
    Rgb::new(
        lerp(c1.r as f64, c2.r as f64, t).round() as u8,
        lerp(c1.g as f64, c2.g as f64, t).round() as u8,
        lerp(c1.b as f64, c2.b as f64, t).round() as u8,
    )
}

fn multi_stop(stops: &[ColorStop], t: f64) -> Rgb {
    let first = stops[0].color;
    let last = stops[stops.len() - 1].color;
    if t.is_nan() || t <= 0.0 {
        return first;
    }
    if t >= 1.0 {
        return last;
    }
    stops
        .windows(2)
        .find(|pair| t <= pair[1].t)
        .map(|pair| {
            let ratio = (t - pair[0].t) / (pair[1].t - pair[0].t);
            lerp_color(pair[0].color, pair[1].color, ratio)
        })
        .unwrap_or(last)
}

/// Evaluate a color scheme at normalized position `t` in [0, 1].
///
/// Positions outside the unit interval are clamped.
pub fn evaluate(scheme: ColorScheme, t: f64) -> Rgb {
    match scheme {
        ColorScheme::Grayscale => {
            let v = gray_level(t);
            Rgb::new(v, v, v)
        }
        ColorScheme::Ndvi => multi_stop(NDVI_STOPS, t),
        ColorScheme::RedYellowGreen => multi_stop(RDYLGN_STOPS, t),
    }
}

/// Linear 0..=255 ramp.
pub fn gray_level(t: f64) -> u8 {
    if t.is_nan() {
        return 0;
    }
    (t.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grayscale_endpoints_and_midpoint() {
        assert_eq!(evaluate(ColorScheme::Grayscale, 0.0), Rgb::new(0, 0, 0));
        assert_eq!(evaluate(ColorScheme::Grayscale, 0.5), Rgb::new(128, 128, 128));
        assert_eq!(evaluate(ColorScheme::Grayscale, 1.0), Rgb::new(255, 255, 255));
    }

    #[test]
    fn ndvi_endpoints() {
        assert_eq!(evaluate(ColorScheme::Ndvi, 0.0), Rgb::new(120, 70, 20));
        assert_eq!(evaluate(ColorScheme::Ndvi, 1.0), Rgb::new(10, 100, 20));
    }

    #[test]
    fn ndvi_hits_interior_stop() {
        assert_eq!(evaluate(ColorScheme::Ndvi, 0.5), Rgb::new(240, 230, 100));
    }

    #[test]
    fn out_of_range_is_clamped() {
        assert_eq!(
            evaluate(ColorScheme::RedYellowGreen, -0.5),
            evaluate(ColorScheme::RedYellowGreen, 0.0)
        );
        assert_eq!(
            evaluate(ColorScheme::RedYellowGreen, 1.5),
            evaluate(ColorScheme::RedYellowGreen, 1.0)
        );
        assert_eq!(gray_level(f64::NAN), 0);
    }

    #[test]
    fn scheme_names_round_trip() {
        for &scheme in ColorScheme::ALL {
            assert_eq!(ColorScheme::from_name(scheme.name()), Some(scheme));
        }
        assert_eq!(ColorScheme::from_name("NDVI"), Some(ColorScheme::Ndvi));
        assert_eq!(ColorScheme::from_name("viridis"), None);
    }
}
