//! Pluggable image decoding for HTTP responses
//!
//! No codec ships with the crate. An application that wants response bodies
//! turned into pixels supplies an [`ImageDecoder`] to the runtime builder.

use crate::Result;

/// Pixel dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u16,
    pub height: u16,
}

impl ImageSize {
    /// `width | height << 16`
    pub fn packed(&self) -> u32 {
        u32::from(self.width) | (u32::from(self.height) << 16)
    }
}

/// Decoded pixel buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u16,
    pub height: u16,
}

impl DecodedImage {
    pub fn size(&self) -> ImageSize {
        ImageSize {
            width: self.width,
            height: self.height,
        }
    }
}

pub trait ImageDecoder: Send + Sync {
    /// Decode an encoded image; errors leave the response untouched
    fn decode(&self, data: &[u8]) -> Result<DecodedImage>;
}

impl<F> ImageDecoder for F
where
    F: Fn(&[u8]) -> Result<DecodedImage> + Send + Sync,
{
    fn decode(&self, data: &[u8]) -> Result<DecodedImage> {
        self(data)
    }
}
