//! Optional conversion of non-RGBA bus frames into preview pixels

use crate::bus::{PixelFormat, VideoFrame};

/// Packed RGBA bytes for a frame the preview cache can store as-is.
///
/// Returns `None` for formats that need color conversion.
pub fn rgba_passthrough(frame: &VideoFrame) -> Option<Vec<u8>> {
    frame.format.is_rgba_layout().then(|| frame.packed_rows())
}

/// Packed RGBA bytes for any supported format, converting when needed
pub fn to_rgba(frame: &VideoFrame) -> Vec<u8> {
    match frame.format {
        PixelFormat::Rgba | PixelFormat::Rgbx => frame.packed_rows(),
        PixelFormat::Bgra | PixelFormat::Bgrx => {
            let mut pixels = frame.packed_rows();
            for px in pixels.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            pixels
        }
        PixelFormat::Uyvy => uyvy_to_rgba(frame, None),
        PixelFormat::Uyva => {
            let plane = frame.stride as usize * frame.height as usize;
            uyvy_to_rgba(frame, Some(&frame.data[plane..]))
        }
    }
}

/// BT.601 limited-range 4:2:2 to RGBA
fn uyvy_to_rgba(frame: &VideoFrame, alpha: Option<&[u8]>) -> Vec<u8> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let stride = frame.stride as usize;
    let mut rgba = Vec::with_capacity(width * height * 4);

    for y in 0..height {
        let row = &frame.data[y * stride..y * stride + width * 2];
        for x in 0..width {
            let pair = (x / 2) * 4;
            let u = row[pair] as f32 - 128.0;
            // An odd trailing pixel has no V of its own: borrow the previous pair's
            let v = row
                .get(pair + 2)
                .or_else(|| pair.checked_sub(2).map(|i| &row[i]))
                .map_or(0.0, |&v| v as f32 - 128.0);
            let luma = row[pair + if x % 2 == 0 { 1 } else { 3 }] as f32;
            let c = 1.164 * (luma - 16.0);

            rgba.push(clamp(c + 1.596 * v));
            rgba.push(clamp(c - 0.392 * u - 0.813 * v));
            rgba.push(clamp(c + 2.017 * u));
            rgba.push(alpha.map_or(255, |plane| plane[y * width + x]));
        }
    }

    rgba
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FrameRate;
    use bytes::Bytes;

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> VideoFrame {
        let rate = FrameRate::default();
        let data = Bytes::from(data);
        VideoFrame::new(width, height, format, rate, data).unwrap()
    }

    #[test]
    fn test_passthrough_only_for_rgba_layouts() {
        let rgbx = frame(PixelFormat::Rgbx, 1, 1, vec![1, 2, 3, 4]);
        assert_eq!(rgba_passthrough(&rgbx), Some(vec![1, 2, 3, 4]));

        let bgra = frame(PixelFormat::Bgra, 1, 1, vec![1, 2, 3, 4]);
        assert_eq!(rgba_passthrough(&bgra), None);
    }

    #[test]
    fn test_bgra_swizzle() {
        let bgra = frame(PixelFormat::Bgra, 2, 1, vec![10, 20, 30, 40, 1, 2, 3, 4]);
        assert_eq!(to_rgba(&bgra), vec![30, 20, 10, 40, 3, 2, 1, 4]);
    }

    #[test]
    fn test_uyvy_white_and_black() {
        // U Y0 V Y1: white then black luma with neutral chroma
        let uyvy = frame(PixelFormat::Uyvy, 2, 1, vec![128, 235, 128, 16]);
        let rgba = to_rgba(&uyvy);

        assert_eq!(&rgba[..4], &[255, 255, 255, 255]);
        assert_eq!(&rgba[4..], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_uyvy_odd_width_reuses_chroma() {
        // U Y0 V Y1 | U Y2 with no trailing V
        let uyvy = frame(PixelFormat::Uyvy, 3, 1, vec![128, 235, 128, 16, 128, 235]);
        let rgba = to_rgba(&uyvy);

        assert_eq!(rgba.len(), 3 * 4);
        assert_eq!(&rgba[4..8], &[0, 0, 0, 255]);
        assert_eq!(&rgba[8..], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_uyvy_single_pixel() {
        let uyvy = frame(PixelFormat::Uyvy, 1, 2, vec![128, 235, 128, 16]);
        assert_eq!(to_rgba(&uyvy), vec![255, 255, 255, 255, 0, 0, 0, 255]);
    }

    #[test]
    fn test_uyva_uses_alpha_plane() {
        let mut data = vec![128, 235, 128, 235];
        data.extend_from_slice(&[7, 9]);
        let uyva = frame(PixelFormat::Uyva, 2, 1, data);
        let rgba = to_rgba(&uyva);

        assert_eq!(rgba[3], 7);
        assert_eq!(rgba[7], 9);
    }
}
