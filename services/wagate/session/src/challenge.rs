//! Pairing challenge bridge.
//!
//! Turns a raw pairing payload into a terminal QR for operators and a PNG
//! `data:` URL for API clients. Both run on the blocking pool so QR encoding
//! never stalls an event pump.

use crate::session::SharedSession;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{GrayImage, ImageFormat, Luma};
use qrcode::render::unicode;
use qrcode::{Color, QrCode};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pixels per QR module in the encoded image
const MODULE_PIXELS: u32 = 8;
/// Light modules around the code, as the QR standard requires
const QUIET_ZONE_MODULES: u32 = 4;

/// Failure to render or encode a challenge
#[derive(Error, Debug)]
pub enum ChallengeError {
    /// Payload does not fit in a QR code
    #[error("QR encoding failed: {0}")]
    Qr(String),
    /// PNG encoding failed
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

impl From<qrcode::types::QrError> for ChallengeError {
    fn from(e: qrcode::types::QrError) -> Self {
        ChallengeError::Qr(e.to_string())
    }
}

/// Produces derived forms of pairing challenges
#[derive(Debug, Clone)]
pub struct ChallengeBridge {
    print_terminal: bool,
}

impl Default for ChallengeBridge {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ChallengeBridge {
    /// Bridge that optionally prints terminal QR codes to the log
    pub fn new(print_terminal: bool) -> Self {
        Self { print_terminal }
    }

    /// Whether terminal renderings are produced
    pub fn prints_terminal(&self) -> bool {
        self.print_terminal
    }

    /// Render and encode `payload` in the background.
    ///
    /// Returns immediately. Each derived form attaches to `session` only if
    /// `payload` is still its current challenge when the work finishes.
    pub fn dispatch(&self, session: SharedSession, payload: String) {
        if self.print_terminal {
            let session = session.clone();
            let payload = payload.clone();
            tokio::task::spawn_blocking(move || match render_terminal(&payload) {
                Ok(rendered) => {
                    info!(
                        "Scan to pair session {}:\n{}",
                        session.id(),
                        rendered
                    );
                    session.attach_rendered(&payload, rendered);
                }
                Err(e) => warn!("Terminal QR for session {} failed: {}", session.id(), e),
            });
        }

        tokio::task::spawn_blocking(move || match encode_data_url(&payload) {
            Ok(encoded) => {
                if session.attach_encoded(&payload, encoded) {
                    debug!("QR image ready for session {}", session.id());
                }
            }
            Err(e) => warn!("QR image for session {} failed: {}", session.id(), e),
        });
    }
}

/// Render a payload as a compact unicode QR code (two rows per line)
pub fn render_terminal(payload: &str) -> Result<String, ChallengeError> {
    let code = QrCode::new(payload.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// Encode a payload as a PNG QR code inside a `data:image/png;base64,` URL
pub fn encode_data_url(payload: &str) -> Result<String, ChallengeError> {
    let code = QrCode::new(payload.as_bytes())?;
    let width = code.width() as u32;
    let colors = code.to_colors();
    let side = (width + 2 * QUIET_ZONE_MODULES) * MODULE_PIXELS;

    let image = GrayImage::from_fn(side, side, |x, y| {
        let mx = (x / MODULE_PIXELS).checked_sub(QUIET_ZONE_MODULES);
        let my = (y / MODULE_PIXELS).checked_sub(QUIET_ZONE_MODULES);
        let dark = match (mx, my) {
            (Some(mx), Some(my)) if mx < width && my < width => {
                colors[(my * width + mx) as usize] == Color::Dark
            }
            _ => false,
        };
        if dark {
            Luma([0u8])
        } else {
            Luma([255u8])
        }
    });

    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(png.into_inner())
    ))
}
