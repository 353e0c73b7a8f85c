//! Pairing-code QR rendering.
//!
//! The code itself travels through the API as plain text; this module only
//! produces the scannable PNG presentation of it, as a
//! `data:image/png;base64,...` URL clients can drop into an `<img>` tag.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, QrCode};
use std::io::Cursor;

/// Pixels per QR module.
const MODULE_PIXELS: u32 = 8;

/// Quiet-zone width in modules on each side, per the QR standard minimum.
const QUIET_ZONE_MODULES: u32 = 4;

/// Renders a pairing code as a PNG data URL.
pub fn pairing_code_data_url(code: &str) -> Result<String> {
    let qr = QrCode::new(code.as_bytes()).context("QR encoding failed")?;
    let width = qr.width() as u32;
    let colors = qr.to_colors();

    let side = (width + 2 * QUIET_ZONE_MODULES) * MODULE_PIXELS;
    let image = GrayImage::from_fn(side, side, |x, y| {
        let mx = x / MODULE_PIXELS;
        let my = y / MODULE_PIXELS;
        let in_code = mx >= QUIET_ZONE_MODULES
            && my >= QUIET_ZONE_MODULES
            && mx < QUIET_ZONE_MODULES + width
            && my < QUIET_ZONE_MODULES + width;
        let dark = in_code && {
            let cx = mx - QUIET_ZONE_MODULES;
            let cy = my - QUIET_ZONE_MODULES;
            colors[(cy * width + cx) as usize] == Color::Dark
        };
        if dark {
            Luma([0u8])
        } else {
            Luma([255u8])
        }
    });

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("PNG encoding failed")?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&png)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_is_a_png() {
        let url = pairing_code_data_url("A1B2C3D4").unwrap();
        let encoded = url.strip_prefix("data:image/png;base64,").unwrap();

        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn different_codes_render_differently() {
        let a = pairing_code_data_url("AAAA0000").unwrap();
        let b = pairing_code_data_url("BBBB1111").unwrap();
        assert_ne!(a, b);
    }
}
