use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl DecodeError {
    pub fn path(&self) -> &Path {
        match self {
            DecodeError::Io { path, .. } | DecodeError::Image { path, .. } => path,
        }
    }
}

/// Loads an image file into an 8-bit RGB pixel grid.
///
/// Implementations must drop alpha and broadcast grayscale to all three
/// channels, so the hasher always sees exactly three channels.
pub trait Decoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<RgbImage, DecodeError>;
}

/// Decoder backed by the `image` crate. The format is sniffed from the file
/// contents, so a misnamed extension still decodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDecoder;

impl Decoder for FileDecoder {
    fn decode(&self, path: &Path) -> Result<RgbImage, DecodeError> {
        let io_err = |source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let image_err = |source| DecodeError::Image {
            path: path.to_path_buf(),
            source,
        };

        let img = ImageReader::open(path)
            .map_err(io_err)?
            .with_guessed_format()
            .map_err(io_err)?
            .decode()
            .map_err(image_err)?;

        Ok(img.to_rgb8())
    }
}
