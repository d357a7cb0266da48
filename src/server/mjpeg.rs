//! JPEG encoding and multipart framing

use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageError, RgbaImage};

/// Multipart boundary token advertised in the response content type
pub const BOUNDARY: &str = "frame";

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Encode an RGBA image as a baseline JPEG. Alpha is discarded.
pub fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let rgb: Vec<u8> = image
        .as_raw()
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    let mut jpeg = Vec::with_capacity(rgb.len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode(&rgb, image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

/// One multipart part: boundary, part headers, JPEG bytes, trailing CRLF
pub fn part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    buf.put_slice(PART_HEADER);
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}
