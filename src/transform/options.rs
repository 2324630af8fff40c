use std::fmt;

/// Options specifies the transformations to be performed on the
/// requested image.
///
/// Width and height are interpreted per [`Options::parse`]: integer
/// values of 1 or more are exact pixel values, floats strictly between
/// 0 and 1 are fractions of the original dimension, and 0 preserves the
/// aspect ratio based on the other dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Options {
    pub width: f64,
    pub height: f64,

    /// Resize to fit within the box instead of cropping to fill it.
    pub fit: bool,

    /// Degrees of counter-clockwise rotation. Only 90, 180 and 270 have
    /// an effect.
    pub rotate: i32,

    pub flip_vertical: bool,
    pub flip_horizontal: bool,
}

impl Options {
    /// Parse a comma separated list of transformation options.
    ///
    /// Recognized tokens, later tokens overriding earlier ones:
    ///
    /// - `fit`: scale inside the box, never crop
    /// - `fv` / `fh`: flip vertical / horizontal
    /// - `r<degrees>`: rotate counter-clockwise
    /// - `<w>x<h>`: width and height; an omitted side keeps its value
    /// - a bare number: square dimensions
    ///
    /// Unknown tokens are ignored:
    ///
    /// ```text
    /// 0x0       - no resizing
    /// 200x      - 200 pixels wide, proportional height
    /// 0.15x     - 15% original width, proportional height
    /// 100x150   - 100 by 150 pixels, cropping as needed
    /// 150,fit   - scale to fit 150 pixels square, no cropping
    /// 100,r90   - 100 pixels square, rotated 90 degrees
    /// ```
    pub fn parse(s: &str) -> Options {
        let mut options = Options::default();

        for opt in s.split(',') {
            match opt {
                "fit" => options.fit = true,
                "fv" => options.flip_vertical = true,
                "fh" => options.flip_horizontal = true,
                _ if opt.len() > 2 && opt.starts_with('r') => {
                    options.rotate = opt[1..].parse().unwrap_or(0);
                }
                _ if opt.contains('x') => {
                    if let Some((w, h)) = opt.split_once('x') {
                        if !w.is_empty() {
                            options.width = w.parse().unwrap_or(0.0);
                        }
                        if !h.is_empty() {
                            options.height = h.parse().unwrap_or(0.0);
                        }
                    }
                }
                _ => {
                    if let Ok(size) = opt.parse::<f64>() {
                        options.width = size;
                        options.height = size;
                    }
                }
            }
        }

        options
    }

    pub fn is_empty(&self) -> bool {
        *self == Options::default()
    }
}

/// The canonical form: `{W}x{H}` followed by `,fit`, `,r{N}`, `,fv`,
/// `,fh` in that fixed order. Parsing the canonical form yields the
/// same value back.
impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)?;
        if self.fit {
            f.write_str(",fit")?;
        }
        if self.rotate != 0 {
            write!(f, ",r{}", self.rotate)?;
        }
        if self.flip_vertical {
            f.write_str(",fv")?;
        }
        if self.flip_horizontal {
            f.write_str(",fh")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(
        width: f64,
        height: f64,
        fit: bool,
        rotate: i32,
        flip_vertical: bool,
        flip_horizontal: bool,
    ) -> Options {
        Options {
            width,
            height,
            fit,
            rotate,
            flip_vertical,
            flip_horizontal,
        }
    }

    #[test]
    fn display() {
        assert_eq!(Options::default().to_string(), "0x0");
        assert_eq!(
            opts(1.0, 2.0, true, 90, true, true).to_string(),
            "1x2,fit,r90,fv,fh"
        );
    }

    #[test]
    fn parse() {
        let tests: &[(&str, Options)] = &[
            ("", Options::default()),
            ("x", Options::default()),
            ("0", Options::default()),
            (",,,,", Options::default()),
            // size variations
            ("1x", opts(1.0, 0.0, false, 0, false, false)),
            ("x1", opts(0.0, 1.0, false, 0, false, false)),
            ("1x2", opts(1.0, 2.0, false, 0, false, false)),
            ("-1x-2", opts(-1.0, -2.0, false, 0, false, false)),
            ("0.1x0.2", opts(0.1, 0.2, false, 0, false, false)),
            ("1", opts(1.0, 1.0, false, 0, false, false)),
            ("0.1", opts(0.1, 0.1, false, 0, false, false)),
            // additional flags
            ("fit", opts(0.0, 0.0, true, 0, false, false)),
            ("r90", opts(0.0, 0.0, false, 90, false, false)),
            ("fv", opts(0.0, 0.0, false, 0, true, false)),
            ("fh", opts(0.0, 0.0, false, 0, false, true)),
            // duplicate flags (last one wins)
            ("1x2,3x4", opts(3.0, 4.0, false, 0, false, false)),
            ("1x2,3", opts(3.0, 3.0, false, 0, false, false)),
            ("1x2,0x3", opts(0.0, 3.0, false, 0, false, false)),
            ("1x,x2", opts(1.0, 2.0, false, 0, false, false)),
            ("r90,r270", opts(0.0, 0.0, false, 270, false, false)),
            // mix of valid and invalid flags
            ("FOO,1,BAR,r90,BAZ", opts(1.0, 1.0, false, 90, false, false)),
            // all flags, in different orders
            ("1x2,fit,r90,fv,fh", opts(1.0, 2.0, true, 90, true, true)),
            ("r90,fh,1x2,fv,fit", opts(1.0, 2.0, true, 90, true, true)),
        ];

        for (input, want) in tests {
            assert_eq!(Options::parse(input), *want, "parse({:?})", input);
        }
    }

    #[test]
    fn canonical_round_trip() {
        let inputs = [
            "",
            "1x2,fit,r90,fv,fh",
            "r90,fh,1x2,fv,fit",
            "FOO,1,BAR,r90,BAZ",
            "0.15x",
            "x100",
            "200x,fv",
            "r90,r270",
            "-1x-2",
        ];
        for s in inputs {
            let once = Options::parse(s).to_string();
            let twice = Options::parse(&once).to_string();
            assert_eq!(once, twice, "round trip for {:?}", s);
        }
    }
}
