//! Latest-frame preview cache keyed by output stream name.
//!
//! Each entry is an `Arc<RgbaImage>`. Readers clone the `Arc` and encode
//! from it without holding the lock; writers replace or copy into the image
//! under the write lock. A same-size update reuses the buffer when no reader
//! holds it and copies on write otherwise, so a reader never sees a half
//! written frame or dimensions that disagree with its buffer.

pub mod convert;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use image::RgbaImage;
use once_cell::sync::Lazy;
use tracing::debug;

/// Placeholder resolution served before a stream has produced a frame
pub const PLACEHOLDER_WIDTH: u32 = 1920;
pub const PLACEHOLDER_HEIGHT: u32 = 1080;

static PLACEHOLDER: Lazy<Arc<RgbaImage>> =
    Lazy::new(|| Arc::new(RgbaImage::new(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)));

/// Fully transparent placeholder image, shared process-wide
pub fn placeholder() -> Arc<RgbaImage> {
    Arc::clone(&PLACEHOLDER)
}

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("invalid preview dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("preview buffer is {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Found(Arc<RgbaImage>),
    /// No entry for the name; carries the placeholder
    NotFound(Arc<RgbaImage>),
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn image(&self) -> &Arc<RgbaImage> {
        match self {
            Lookup::Found(image) | Lookup::NotFound(image) => image,
        }
    }

    pub fn into_image(self) -> Arc<RgbaImage> {
        match self {
            Lookup::Found(image) | Lookup::NotFound(image) => image,
        }
    }
}

#[derive(Default)]
pub struct PreviewCache {
    entries: RwLock<HashMap<String, Arc<RgbaImage>>>,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Lookup {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(name) {
            Some(image) => Lookup::Found(Arc::clone(image)),
            None => Lookup::NotFound(placeholder()),
        }
    }

    /// Replace (or create) the entry with the transparent placeholder
    pub fn reset(&self, name: &str) {
        debug!(stream = name, "Preview reset");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), placeholder());
    }

    /// Store a tightly packed RGBA frame for `name`.
    ///
    /// `pixels` must hold exactly `width * height * 4` bytes; anything else is
    /// rejected and the cache is left untouched.
    pub fn set_frame(
        &self,
        name: &str,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), PreviewError> {
        if width == 0 || height == 0 {
            return Err(PreviewError::InvalidDimensions { width, height });
        }

        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(PreviewError::LengthMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(name) {
            Some(image) if image.dimensions() == (width, height) => {
                // Clones only if a reader still holds the current image
                Arc::make_mut(image).copy_from_slice(pixels);
            }
            Some(image) => {
                debug!(
                    stream = name,
                    from = ?image.dimensions(),
                    to = ?(width, height),
                    "Preview resized"
                );
                *image = Arc::new(new_image(pixels, width, height));
            }
            None => {
                debug!(stream = name, width, height, "Preview created");
                entries.insert(name.to_string(), Arc::new(new_image(pixels, width, height)));
            }
        }

        Ok(())
    }

    /// Names with a cached entry, sorted
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_image(pixels: &[u8], width: u32, height: u32) -> RgbaImage {
    let mut image = RgbaImage::new(width, height);
    image.copy_from_slice(pixels);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pattern(width: u32, height: u32, seed: u8) -> Vec<u8> {
        (0..width * height * 4)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let cache = PreviewCache::new();
        for (width, height) in [(1, 1), (3, 7), (64, 36), (1920, 1080)] {
            let pixels = pattern(width, height, 3);
            cache.set_frame("out", &pixels, width, height).unwrap();

            let lookup = cache.get("out");
            assert!(lookup.is_found());
            let image = lookup.image();
            assert_eq!(image.dimensions(), (width, height));
            assert_eq!(image.as_raw().len(), (width * height * 4) as usize);
            assert_eq!(image.as_raw(), &pixels);
        }
    }

    #[test]
    fn test_same_size_update_reuses_buffer() {
        let cache = PreviewCache::new();
        cache.set_frame("out", &pattern(8, 4, 0), 8, 4).unwrap();
        let before = cache.get("out").image().as_ptr();

        let next = pattern(8, 4, 100);
        cache.set_frame("out", &next, 8, 4).unwrap();

        let image = cache.get("out").into_image();
        assert_eq!(image.as_ptr(), before);
        assert_eq!(image.as_raw(), &next);
    }

    #[test]
    fn test_update_while_read_copies_on_write() {
        let cache = PreviewCache::new();
        let first = pattern(4, 4, 1);
        cache.set_frame("out", &first, 4, 4).unwrap();

        let held = cache.get("out").into_image();
        cache.set_frame("out", &pattern(4, 4, 2), 4, 4).unwrap();

        // The reader keeps the complete old frame
        assert_eq!(held.as_raw(), &first);
        assert_ne!(cache.get("out").image().as_raw(), &first);
    }

    #[test]
    fn test_resize_replaces_entry() {
        let cache = PreviewCache::new();
        cache.set_frame("out", &pattern(4, 4, 0), 4, 4).unwrap();
        cache.set_frame("out", &pattern(2, 3, 0), 2, 3).unwrap();

        let image = cache.get("out").into_image();
        assert_eq!(image.dimensions(), (2, 3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let cache = PreviewCache::new();
        let err = cache.set_frame("out", &[0u8; 15], 2, 2).unwrap_err();
        assert!(matches!(
            err,
            PreviewError::LengthMismatch {
                expected: 16,
                actual: 15,
                ..
            }
        ));
        assert!(cache.is_empty());

        assert!(matches!(
            cache.set_frame("out", &[], 0, 10),
            Err(PreviewError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_reset_gives_transparent_placeholder() {
        let cache = PreviewCache::new();
        cache.set_frame("out", &[255u8; 16], 2, 2).unwrap();
        cache.reset("out");

        let lookup = cache.get("out");
        assert!(lookup.is_found());
        let image = lookup.image();
        assert_eq!(image.dimensions(), (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
        assert!(image.pixels().all(|pixel| pixel[3] == 0));
    }

    #[test]
    fn test_placeholder_never_mutated_by_updates() {
        let cache = PreviewCache::new();
        cache.reset("out");

        let full = vec![255u8; (PLACEHOLDER_WIDTH * PLACEHOLDER_HEIGHT * 4) as usize];
        cache
            .set_frame("out", &full, PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)
            .unwrap();

        assert!(placeholder().pixels().all(|pixel| pixel[3] == 0));
        let image = cache.get("out").into_image();
        assert!(image.pixels().all(|pixel| pixel[3] == 255));
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let cache = PreviewCache::new();
        let lookup = cache.get("missing");

        assert!(!lookup.is_found());
        assert_eq!(
            lookup.image().dimensions(),
            (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)
        );
    }

    #[test]
    fn test_concurrent_resize_is_consistent() {
        let cache = Arc::new(PreviewCache::new());
        cache.set_frame("out", &[1u8; 16 * 16 * 4], 16, 16).unwrap();

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..500u32 {
                    let (width, height) = if i % 2 == 0 { (16, 16) } else { (40, 10) };
                    // Uniform non-zero fill per write, never the seed value
                    let fill = (i % 250) as u8 + 2;
                    let pixels = vec![fill; (width * height * 4) as usize];
                    cache.set_frame("out", &pixels, width, height).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let image = cache.get("out").into_image();
                        let (width, height) = image.dimensions();
                        assert_eq!(image.as_raw().len(), (width * height * 4) as usize);
                        // Every byte comes from the same write
                        let first = image.as_raw()[0];
                        assert_ne!(first, 0);
                        assert!(image.as_raw().iter().all(|&b| b == first));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
