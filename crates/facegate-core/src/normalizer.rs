//! Face normalization: crop, resize to the canonical 200×200 grid, and
//! equalize.
//!
//! The template path runs global histogram equalization (overall exposure)
//! followed by CLAHE (uneven lighting across the face). The display path
//! only crops and resizes the color frame. Both use the same region.

use crate::types::{DisplayImage, FaceRegion, FaceTemplate, TEMPLATE_SIZE};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::contrast::equalize_histogram;

const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILES: u32 = 8;

/// Build both the classifier template and the display crop for `region`.
pub fn normalize(luma: &GrayImage, color: &RgbImage, region: FaceRegion) -> (FaceTemplate, DisplayImage) {
    (template(luma, region), display_crop(color, region))
}

/// Crop, resize, and equalize the luminance region into a [`FaceTemplate`].
pub fn template(luma: &GrayImage, region: FaceRegion) -> FaceTemplate {
    let crop = imageops::crop_imm(luma, region.x, region.y, region.width, region.height).to_image();
    let resized = resize_bilinear(&crop, TEMPLATE_SIZE, TEMPLATE_SIZE);
    let mut equalized = equalize_histogram(&resized);
    clahe_enhance(&mut equalized, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    FaceTemplate::from_image(equalized)
}

/// Crop and resize the color region into a [`DisplayImage`].
///
/// Decoded frames are already RGB, which is the display channel order.
pub fn display_crop(color: &RgbImage, region: FaceRegion) -> DisplayImage {
    let crop = imageops::crop_imm(color, region.x, region.y, region.width, region.height).to_image();
    DisplayImage::from_image(imageops::resize(&crop, TEMPLATE_SIZE, TEMPLATE_SIZE, FilterType::Triangle))
}

/// Bilinear resize with pixel-center alignment; same-size input is copied exactly.
pub fn resize_bilinear(src: &GrayImage, new_w: u32, new_h: u32) -> GrayImage {
    let (width, height) = (src.width() as usize, src.height() as usize);
    if width == 0 || height == 0 {
        return GrayImage::new(new_w, new_h);
    }
    let frame = src.as_raw();
    let inv_x = width as f32 / new_w as f32;
    let inv_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w as usize * new_h as usize];
    for y in 0..new_h as usize {
        let src_y = (y as f32 + 0.5) * inv_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w as usize {
            let src_x = (x as f32 + 0.5) * inv_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w as usize + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImage::from_raw(new_w, new_h, resized).unwrap_or_else(|| GrayImage::new(new_w, new_h))
}

/// Contrast-Limited Adaptive Histogram Equalization, in place.
///
/// The image is split into a `tiles`×`tiles` grid. Each tile histogram is
/// clipped at `clip_limit` times the mean bin height, the excess is spread
/// over all bins, and every pixel is mapped by bilinear interpolation
/// between the four nearest tile lookup tables.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    let t = tiles as usize;
    if t == 0 {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
    let lut_scale = 255.0 / tile_pixels as f32;
    let data: &mut [u8] = &mut **gray;

    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;
            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[data[y * w + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let batch = excess / 256;
            let mut residual = (excess % 256) as usize;
            for bin in hist.iter_mut() {
                *bin += batch;
            }
            if residual > 0 {
                let step = (256 / residual).max(1);
                let mut i = 0;
                while i < 256 && residual > 0 {
                    hist[i] += 1;
                    residual -= 1;
                    i += step;
                }
            }

            let mut lut = [0f32; 256];
            let mut cumulative = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                cumulative += count;
                lut[i] = (cumulative as f32 * lut_scale).clamp(0.0, 255.0);
            }
            luts.push(lut);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let pixel = data[y * w + x] as usize;
            let top = luts[r0 * t + c0][pixel] * (1.0 - dx) + luts[r0 * t + c1][pixel] * dx;
            let bot = luts[r1 * t + c0][pixel] * (1.0 - dx) + luts[r1 * t + c1][pixel] * dx;
            data[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}
