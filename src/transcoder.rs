use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb, RgbImage};

use crate::capture::VideoFrame;
use crate::errors::{Result, StreamError};

const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

pub struct FrameTranscoder {
    quality: u8,
}

impl FrameTranscoder {
    pub fn new(quality: u8) -> Self {
        Self { quality: quality.clamp(1, 100) }
    }

    /// Turns a captured frame into a self-contained JPEG image.
    pub fn encode(&self, frame: VideoFrame) -> Result<Bytes> {
        match frame {
            VideoFrame::Jpeg(data) => {
                if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
                    return Err(StreamError::encode("captured buffer is not a JPEG image"));
                }
                Ok(data)
            }
            VideoFrame::Rgb(image) => {
                let mut jpeg_data = Vec::with_capacity(64 * 1024);
                JpegEncoder::new_with_quality(&mut jpeg_data, self.quality).encode_image(&image)?;
                Ok(Bytes::from(jpeg_data))
            }
        }
    }
}

/// Wire form of one frame: a data URI the browser can assign straight to an `<img>`.
pub fn to_data_uri(jpeg: &[u8]) -> String {
    let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + jpeg.len().div_ceil(3) * 4);
    uri.push_str(DATA_URI_PREFIX);
    STANDARD.encode_string(jpeg, &mut uri);
    uri
}

/// Moving colour pattern used by `test:` locators.
pub fn test_pattern(width: u32, height: u32, tick: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let r = (x.wrapping_add(tick.wrapping_mul(4)) % 255) as u8;
        let g = 128 + (y.wrapping_add(tick.wrapping_mul(2)) % 127) as u8;
        let b = ((x + y).wrapping_add(tick.wrapping_mul(8)) % 255) as u8;

        Rgb([r, g, b])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_format() {
        assert_eq!(to_data_uri(&[0xFF, 0xFF, 0xFF, 0xFF]), "data:image/jpeg;base64,/////w==");
        assert_eq!(to_data_uri(&[]), "data:image/jpeg;base64,");
    }

    #[test]
    fn test_encode_raw_frame_produces_jpeg() {
        let transcoder = FrameTranscoder::new(75);
        let jpeg = transcoder.encode(VideoFrame::Rgb(test_pattern(64, 48, 3))).unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_encode_passes_jpeg_through() {
        let transcoder = FrameTranscoder::new(75);
        let data = Bytes::from_static(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]);

        assert_eq!(transcoder.encode(VideoFrame::Jpeg(data.clone())).unwrap(), data);
        assert!(transcoder.encode(VideoFrame::Jpeg(Bytes::from_static(b"nope"))).is_err());
    }

    #[test]
    fn test_pattern_moves() {
        assert_ne!(test_pattern(8, 8, 0), test_pattern(8, 8, 1));
    }
}
