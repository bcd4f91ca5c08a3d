//! Raw texture atlas: the ordered set of encoded images of one tile,
//! one per internally textured submesh.

use std::path::Path;

use crate::error::{Result, TileStoreError};
use crate::multifile;

const MAGIC: [u8; 2] = *b"AT";
const VERSION: u16 = 1;

/// Ordered list of encoded (JPEG) images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAtlas {
    images: Vec<Vec<u8>>,
}

impl RawAtlas {
    pub fn new() -> Self {
        RawAtlas::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn add(&mut self, image: Vec<u8>) {
        self.images.push(image);
    }

    pub fn valid(&self, index: usize) -> bool {
        index < self.images.len() && !self.images[index].is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&[u8]> {
        self.images
            .get(index)
            .map(|v| v.as_slice())
            .ok_or_else(|| TileStoreError::Key(format!("atlas has no image {index}")))
    }

    pub fn images(&self) -> &[Vec<u8>] {
        &self.images
    }

    /// Texture area of image `index` in pixels squared, decoded from the
    /// image header.
    pub fn area(&self, index: usize) -> Result<f64> {
        let data = self.get(index)?;
        let (width, height) = image_dimensions(data)?;
        Ok(width as f64 * height as f64)
    }

    /// Concatenate another atlas (tile merge path).
    pub fn append(&mut self, other: &RawAtlas) {
        self.images.extend(other.images.iter().cloned());
    }

    pub fn save(&self) -> Vec<u8> {
        let mut builder = multifile::Builder::new(MAGIC, VERSION);
        for image in &self.images {
            builder.add_part(image);
        }
        builder.finish()
    }

    pub fn load(data: &[u8], path: &Path) -> Result<RawAtlas> {
        let table = multifile::read_table(data, MAGIC, VERSION, path)?;
        let images = table
            .parts
            .iter()
            .map(|part| multifile::part_slice(data, *part).to_vec())
            .collect();
        Ok(RawAtlas { images })
    }
}

fn image_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let reader = image::ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()
        .map_err(TileStoreError::Io)?;
    reader
        .into_dimensions()
        .map_err(|e| TileStoreError::Format(format!("unreadable atlas image: {e}")))
}

/// Encode a single-color JPEG; used by tooling and tests that need a
/// well-formed atlas image.
pub fn solid_jpeg(width: u32, height: u32, luma: u8) -> Vec<u8> {
    let img = image::GrayImage::from_pixel(width, height, image::Luma([luma]));
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
    encoder
        .encode_image(&img)
        .expect("in-memory jpeg encoding cannot fail");
    out
}
