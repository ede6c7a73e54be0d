//! Draw detections and the count banner onto images.
//!
use std::io::Cursor;

use anyhow::{Context, Result};
use image::{codecs::jpeg::JpegEncoder, ColorType, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::{Font, Scale};

use crate::nn::{Detection, InferModel};

const BOX_COLOR: Rgb<u8> = Rgb([255, 56, 56]);
const BANNER_COLOR: Rgb<u8> = Rgb([27, 77, 137]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Text height in pixels at a font scale of one.
const TEXT_HEIGHT: f32 = 32.0;

/// Annotated image together with the number of detections drawn on it.
pub struct Annotated {
    pub image: RgbImage,
    pub count: usize,
}

/// Run the model on `image` and annotate the result.
pub fn process_image(
    model: &dyn InferModel,
    image: RgbImage,
    confidence: f32,
) -> Result<Annotated> {
    let detections = model.run(&image, confidence)?;
    let count = detections.len();
    log::debug!("Found {} larvae at confidence {:.2}", count, confidence);

    let mut image = image;
    draw_detections(&mut image, &detections);
    draw_count_banner(&mut image, count);

    Ok(Annotated { image, count })
}

/// Draw a thin box around every detection, without labels.
pub fn draw_detections(frame: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        let [x_tl, y_tl, x_br, y_br] = detection.bbox;
        let rect_width = (x_br - x_tl).max(1.0);
        let rect_height = (y_br - y_tl).max(1.0);

        let rect =
            Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width as u32, rect_height as u32);
        draw_hollow_rect_mut(frame, rect, BOX_COLOR);
    }
}

/// Font scale grows with images wider than 1000 pixels.
fn font_scale(width: u32) -> f32 {
    f32::max(1.0, width as f32 / 1000.0)
}

/// Draw a filled banner with the total count into the top-left corner.
pub fn draw_count_banner(frame: &mut RgbImage, count: usize) {
    let text = format!("TOTAL: {count}");
    let font_scale = font_scale(frame.width());
    let scale = Scale::uniform(TEXT_HEIGHT * font_scale);
    let margin = (10.0 * font_scale) as i32;

    let (text_w, text_h) = text_size(scale, &BANNER_FONT, &text);
    let banner = Rect::at(0, 0).of_size(
        (text_w + 2 * margin).max(1) as u32,
        (text_h + 2 * margin).max(1) as u32,
    );

    draw_filled_rect_mut(frame, banner, BANNER_COLOR);
    draw_text_mut(frame, TEXT_COLOR, margin, margin, scale, &BANNER_FONT, &text);
}

/// Encode an image as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = frame.dimensions();
    let mut buf = Cursor::new(Vec::new());

    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(frame, width, height, ColorType::Rgb8)
        .context("failed to encode JPEG")?;

    Ok(buf.into_inner())
}

lazy_static! {
    static ref BANNER_FONT: Font<'static> = {
        let font_data: &[u8] = include_bytes!("../../resources/DejaVuSans-Bold.ttf");
        Font::try_from_bytes(font_data).expect("failed to load font")
    };
}
