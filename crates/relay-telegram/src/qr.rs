//! Pairing challenge rendering (QR code as PNG).

use std::io::Cursor;

use image::{ImageFormat, Luma};
use qrcode::QrCode;

use relay_core::{errors::Error, pairing::ChallengeRenderer, Result};

/// Renders challenges as square QR PNGs at least `min_size` pixels wide.
#[derive(Clone, Copy, Debug)]
pub struct QrRenderer {
    min_size: u32,
}

impl QrRenderer {
    pub fn new(min_size: u32) -> Self {
        Self { min_size }
    }
}

impl Default for QrRenderer {
    fn default() -> Self {
        Self::new(500)
    }
}

impl ChallengeRenderer for QrRenderer {
    fn render_png(&self, challenge: &str) -> Result<Vec<u8>> {
        let code = QrCode::new(challenge.as_bytes())
            .map_err(|e| Error::External(format!("qr encode failed: {e}")))?;
        let img = code
            .render::<Luma<u8>>()
            .min_dimensions(self.min_size, self.min_size)
            .quiet_zone(true)
            .build();

        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| Error::External(format!("png encode failed: {e}")))?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_png_of_at_least_the_minimum_size() {
        let png = QrRenderer::default()
            .render_png("2@AbCdEf,GhIjKl,MnOpQr")
            .unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let img = image::load_from_memory(&png).unwrap();
        assert!(img.width() >= 500);
        assert_eq!(img.width(), img.height());
    }
}
