use std::io::Cursor;
use std::time::Duration;

use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, DynamicImage, Frame, ImageFormat, Rgba, RgbaImage};
use thiserror::Error;

pub const SLIDESHOW_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("no frames to encode")]
    NoFrames,
}

/// An image held in memory, ready to upload.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    pub fn file_name(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "image.jpg",
            "image/webp" => "image.webp",
            "image/gif" => "image.gif",
            _ => "image.png",
        }
    }
}

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn decode_image(data: &[u8]) -> Result<DynamicImage, MediaError> {
    image::load_from_memory(data).map_err(MediaError::Decode)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, MediaError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(MediaError::Encode)?;
    Ok(bytes)
}

/// Shrinks `image` so neither side exceeds its bound. Never upscales.
pub fn shrink_to_fit(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image.clone();
    }
    image.resize(max_width, max_height, FilterType::Lanczos3)
}

/// Decodes `data` and, when its longest side exceeds `max_side`, scales it
/// down and re-encodes it as PNG. Small images keep their original bytes.
pub fn prepare_for_upload(data: &[u8], max_side: u32) -> Result<PreparedImage, MediaError> {
    let decoded = decode_image(data)?;
    if decoded.width() <= max_side && decoded.height() <= max_side {
        return Ok(PreparedImage {
            bytes: data.to_vec(),
            mime_type: detect_mime_type(data).unwrap_or_else(|| "image/png".to_string()),
            width: decoded.width(),
            height: decoded.height(),
        });
    }

    let resized = shrink_to_fit(&decoded, max_side, max_side);
    Ok(PreparedImage {
        bytes: encode_png(&resized)?,
        mime_type: "image/png".to_string(),
        width: resized.width(),
        height: resized.height(),
    })
}

/// Scales `image` to fit a `width`x`height` canvas (up or down, keeping the
/// aspect ratio) and centers it on a `background` fill.
pub fn letterbox(image: &DynamicImage, width: u32, height: u32, background: Rgba<u8>) -> RgbaImage {
    let fitted = image.resize(width, height, FilterType::Triangle).to_rgba8();
    let mut canvas = RgbaImage::from_pixel(width, height, background);
    let x = (width.saturating_sub(fitted.width()) / 2) as i64;
    let y = (height.saturating_sub(fitted.height()) / 2) as i64;
    imageops::overlay(&mut canvas, &fitted, x, y);
    canvas
}

/// Encodes an endlessly looping GIF showing each frame for `frame_duration`.
pub fn encode_slideshow_gif(frames: Vec<RgbaImage>, frame_duration: Duration) -> Result<Vec<u8>, MediaError> {
    if frames.is_empty() {
        return Err(MediaError::NoFrames);
    }

    let delay = Delay::from_saturating_duration(frame_duration);
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut bytes, 10);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(MediaError::Encode)?;
        encoder
            .encode_frames(
                frames
                    .into_iter()
                    .map(|frame| Frame::from_parts(frame, 0, 0, delay)),
            )
            .map_err(MediaError::Encode)?;
    }
    Ok(bytes)
}
