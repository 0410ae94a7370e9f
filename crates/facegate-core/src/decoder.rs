//! Image ingestion: encoded raster bytes or base64 data URLs into RGB frames.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),
}

/// Raw image input as it arrives from a caller.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// An uploaded file in any raster encoding `image` can guess (JPEG, PNG, ...).
    Encoded(Vec<u8>),
    /// A camera frame such as `data:image/jpeg;base64,/9j/4AAQ...`.
    DataUrl(String),
}

impl ImageInput {
    /// Resolve the input to encoded image bytes, stripping any data-URL scheme.
    pub fn into_bytes(self) -> Result<Vec<u8>, DecodeError> {
        match self {
            ImageInput::Encoded(bytes) => Ok(bytes),
            ImageInput::DataUrl(url) => {
                let payload = match url.split_once(',') {
                    Some((_, rest)) => rest,
                    None => url.as_str(),
                };
                // Data URLs pasted from files are often line-wrapped.
                let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                Ok(STANDARD.decode(compact)?)
            }
        }
    }
}

/// Decode an image input into an 8-bit RGB frame.
pub fn decode(input: ImageInput) -> Result<RgbImage, DecodeError> {
    let bytes = input.into_bytes()?;
    decode_bytes(&bytes)
}

/// Decode encoded bytes into an 8-bit RGB frame.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let frame = image::load_from_memory(bytes)?.to_rgb8();
    tracing::debug!(width = frame.width(), height = frame.height(), "decoded frame");
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let img = RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]));
        let frame = decode(ImageInput::Encoded(png_bytes(&img))).unwrap();
        assert_eq!(frame.dimensions(), (8, 6));
        assert_eq!(frame.get_pixel(3, 3), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_data_url_strips_scheme() {
        let img = RgbImage::from_pixel(4, 4, Rgb([200, 0, 0]));
        let url = format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(&img)));
        let frame = decode(ImageInput::DataUrl(url)).unwrap();
        assert_eq!(frame.get_pixel(0, 0), &Rgb([200, 0, 0]));
    }

    #[test]
    fn test_decode_bare_base64() {
        let img = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        let frame = decode(ImageInput::DataUrl(STANDARD.encode(png_bytes(&img)))).unwrap();
        assert_eq!(frame.dimensions(), (2, 2));
    }

    #[test]
    fn test_decode_wrapped_data_url() {
        let img = RgbImage::from_pixel(6, 5, Rgb([0, 120, 240]));
        let encoded = STANDARD.encode(png_bytes(&img));
        let wrapped: Vec<String> = encoded
            .as_bytes()
            .chunks(20)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        let url = format!("data:image/png;base64,\n{}\r\n", wrapped.join("\n "));
        let frame = decode(ImageInput::DataUrl(url)).unwrap();
        assert_eq!(frame.dimensions(), (6, 5));
        assert_eq!(frame.get_pixel(2, 2), &Rgb([0, 120, 240]));
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode(ImageInput::Encoded(vec![])), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode(ImageInput::Encoded(b"definitely not an image".to_vec()));
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_decode_bad_base64() {
        let result = decode(ImageInput::DataUrl("data:image/png;base64,@@@".into()));
        assert!(matches!(result, Err(DecodeError::Base64(_))));
    }
}
