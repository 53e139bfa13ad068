use crate::error::{Result, SlitScanError};
use crate::pipeline::types::{ColumnPixels, BACKGROUND};
use anyhow::Context;
use image::RgbImage;
use std::path::Path;

/// The reconstructed space-time image: one column per frame.
///
/// Tracks which columns have been written so a column can never be written
/// twice and completeness can be checked before the raster is handed out.
pub struct OutputRaster {
    image: RgbImage,
    written: Vec<bool>,
    written_count: usize,
}

impl OutputRaster {
    pub fn new(frame_count: usize, frame_height: u32) -> Self {
        Self {
            image: RgbImage::from_pixel(frame_count as u32, frame_height, BACKGROUND),
            written: vec![false; frame_count],
            written_count: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn write_column(&mut self, column: usize, pixels: &ColumnPixels) -> Result<()> {
        if column >= self.written.len() {
            return Err(SlitScanError::Decode(format!(
                "column {} is outside the raster (width {})",
                column,
                self.written.len()
            )));
        }
        if pixels.len() != self.image.height() as usize {
            return Err(SlitScanError::InvalidFrameGeometry(format!(
                "column {} has {} samples, raster height is {}",
                column,
                pixels.len(),
                self.image.height()
            )));
        }
        if self.written[column] {
            return Err(SlitScanError::ColumnAlreadyWritten(column));
        }

        for (y, px) in pixels.pixels().iter().enumerate() {
            self.image.put_pixel(column as u32, y as u32, *px);
        }
        self.written[column] = true;
        self.written_count += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.written_count == self.written.len()
    }

    pub fn written_columns(&self) -> usize {
        self.written_count
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Saves the raster losslessly; the format follows the extension (PNG by default).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let format = image::ImageFormat::from_path(path).unwrap_or(image::ImageFormat::Png);
        self.image
            .save_with_format(path, format)
            .with_context(|| format!("Failed to write raster to {:?}", path))?;
        tracing::info!(
            "Saved {}x{} raster to {:?}",
            self.width(),
            self.height(),
            path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn column(height: usize, value: u8) -> ColumnPixels {
        ColumnPixels(vec![Rgb([value, value, value]); height])
    }

    #[test]
    fn test_new_raster_is_background() {
        let raster = OutputRaster::new(5, 3);
        assert_eq!(raster.image().dimensions(), (5, 3));
        assert!(raster.image().pixels().all(|p| *p == BACKGROUND));
        assert!(!raster.is_complete());
    }

    #[test]
    fn test_each_column_written_once() {
        let mut raster = OutputRaster::new(3, 2);
        raster.write_column(1, &column(2, 10)).unwrap();
        assert!(matches!(
            raster.write_column(1, &column(2, 20)),
            Err(SlitScanError::ColumnAlreadyWritten(1))
        ));
        assert_eq!(raster.image().get_pixel(1, 0), &Rgb([10, 10, 10]));

        raster.write_column(0, &column(2, 1)).unwrap();
        raster.write_column(2, &column(2, 2)).unwrap();
        assert!(raster.is_complete());

        let image = raster.into_image();
        assert_eq!(image.get_pixel(0, 1), &Rgb([1, 1, 1]));
        assert_eq!(image.get_pixel(2, 0), &Rgb([2, 2, 2]));
    }

    #[test]
    fn test_rejects_out_of_range_and_wrong_height() {
        let mut raster = OutputRaster::new(3, 2);
        assert!(matches!(
            raster.write_column(3, &column(2, 0)),
            Err(SlitScanError::Decode(_))
        ));
        assert!(matches!(
            raster.write_column(0, &column(5, 0)),
            Err(SlitScanError::InvalidFrameGeometry(_))
        ));
        assert_eq!(raster.written_columns(), 0);
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let mut raster = OutputRaster::new(2, 2);
        raster.write_column(0, &column(2, 7)).unwrap();
        raster.save(&path).unwrap();
        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.get_pixel(0, 1), &Rgb([7, 7, 7]));
        assert_eq!(loaded.get_pixel(1, 1), &BACKGROUND);
    }
}
