use std::fmt;
use std::str::FromStr;

use image::Rgba;

/// Straight (non-premultiplied) RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Black at the given opacity (0.0..=1.0).
    pub fn shade(opacity: f32) -> Self {
        Self::rgba(0, 0, 0, alpha_from_unit(opacity))
    }

    pub fn to_rgba(self) -> Rgba<u8> {
        Rgba([self.r, self.g, self.b, self.a])
    }

    /// Engine color syntax, e.g. `0x000000@0.50`.
    pub fn to_engine(self) -> String {
        format!(
            "0x{:02X}{:02X}{:02X}@{:.2}",
            self.r,
            self.g,
            self.b,
            f32::from(self.a) / 255.0
        )
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:02X}{:02X}{:02X}{:02X}",
            self.r, self.g, self.b, self.a
        )
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let value = input.trim().to_ascii_lowercase();
        if let Some(hex) = value.strip_prefix('#').or_else(|| value.strip_prefix("0x")) {
            return parse_hex(hex).ok_or_else(|| format!("invalid hex color '{input}'"));
        }
        if let Some(body) = value
            .strip_prefix("rgba(")
            .or_else(|| value.strip_prefix("rgb("))
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return parse_functional(body).ok_or_else(|| format!("invalid color '{input}'"));
        }
        named(&value).ok_or_else(|| format!("unknown color '{input}'"))
    }
}

fn parse_hex(hex: &str) -> Option<Color> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    match hex.len() {
        3 => {
            let nibble = |i: usize| u8::from_str_radix(&hex[i..=i], 16).ok().map(|n| n * 17);
            Some(Color::rgb(nibble(0)?, nibble(1)?, nibble(2)?))
        }
        6 => Some(Color::rgb(byte(0)?, byte(2)?, byte(4)?)),
        8 => Some(Color::rgba(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
        _ => None,
    }
}

fn parse_functional(body: &str) -> Option<Color> {
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    let channel = |s: &str| s.parse::<u8>().ok();
    match parts.as_slice() {
        [r, g, b] => Some(Color::rgb(channel(r)?, channel(g)?, channel(b)?)),
        [r, g, b, a] => {
            let alpha: f32 = a.parse().ok()?;
            if !(0.0..=1.0).contains(&alpha) {
                return None;
            }
            Some(Color::rgba(
                channel(r)?,
                channel(g)?,
                channel(b)?,
                alpha_from_unit(alpha),
            ))
        }
        _ => None,
    }
}

fn named(value: &str) -> Option<Color> {
    let color = match value {
        "white" => Color::WHITE,
        "black" => Color::BLACK,
        "red" => Color::rgb(255, 0, 0),
        "green" => Color::rgb(0, 128, 0),
        "blue" => Color::rgb(0, 0, 255),
        "yellow" => Color::rgb(255, 255, 0),
        "gold" => Color::rgb(255, 215, 0),
        "gray" | "grey" => Color::rgb(128, 128, 128),
        "transparent" => Color::rgba(0, 0, 0, 0),
        _ => return None,
    };
    Some(color)
}

fn alpha_from_unit(opacity: f32) -> u8 {
    (opacity.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_notations() {
        assert_eq!("#FFFFFF".parse::<Color>().unwrap(), Color::WHITE);
        assert_eq!("#fff".parse::<Color>().unwrap(), Color::WHITE);
        assert_eq!("0x102030".parse::<Color>().unwrap(), Color::rgb(16, 32, 48));
        assert_eq!(
            "#00000080".parse::<Color>().unwrap(),
            Color::rgba(0, 0, 0, 128)
        );
        assert_eq!(
            "rgba(0,0,0,0.5)".parse::<Color>().unwrap(),
            Color::rgba(0, 0, 0, 128)
        );
        assert_eq!(
            "rgb( 10, 20, 30 )".parse::<Color>().unwrap(),
            Color::rgb(10, 20, 30)
        );
        assert_eq!("Gold".parse::<Color>().unwrap(), Color::rgb(255, 215, 0));
    }

    #[test]
    fn rejects_malformed_colors() {
        for bad in ["#12", "#GGGGGG", "rgba(0,0,0,2)", "rgb(300,0,0)", "chartreuse-ish", ""] {
            assert!(bad.parse::<Color>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn engine_syntax_carries_opacity() {
        assert_eq!(Color::shade(0.65).to_engine(), "0x000000@0.65");
        assert_eq!(Color::WHITE.to_engine(), "0xFFFFFF@1.00");
    }
}
