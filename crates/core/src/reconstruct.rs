//! Turns upscaled working-format frames back into deliverable frames:
//! crops the scaled alignment padding and converts to the delivery format.

use std::sync::Arc;

use tracing::debug;

use crate::convert::{ConversionTarget, FormatConverter};
use crate::error::PipelineError;
use crate::padding::{crop_frame, PaddingSpec};
use crate::types::Frame;

pub struct OutputReconstructor {
    padding: PaddingSpec,
    scale: u32,
    original: (u32, u32),
    target: ConversionTarget,
    converter: Arc<dyn FormatConverter>,
}

impl OutputReconstructor {
    /// `original` is the source frame size before padding.
    pub fn new(
        padding: PaddingSpec,
        scale: u32,
        original: (u32, u32),
        target: ConversionTarget,
        converter: Arc<dyn FormatConverter>,
    ) -> Self {
        Self {
            padding,
            scale,
            original,
            target,
            converter,
        }
    }

    /// Columns and rows removed from the right and bottom edges.
    pub fn crop_amounts(&self) -> (usize, usize) {
        self.padding.scaled(self.scale)
    }

    /// Size of every delivered frame.
    pub fn output_dims(&self) -> (u32, u32) {
        (self.original.0 * self.scale, self.original.1 * self.scale)
    }

    pub fn target(&self) -> &ConversionTarget {
        &self.target
    }

    pub fn reconstruct(&self, frame: &Frame) -> Result<Frame, PipelineError> {
        let (crop_right, crop_bottom) = self.crop_amounts();
        let (width, height) = frame.dims();
        if crop_right >= width as usize || crop_bottom >= height as usize {
            return Err(PipelineError::CropOutOfBounds {
                crop_right,
                crop_bottom,
                width,
                height,
            });
        }

        let out_w = width - crop_right as u32;
        let out_h = height - crop_bottom as u32;
        let expected = self.output_dims();
        if (out_w, out_h) != expected {
            debug!(
                got = ?(out_w, out_h),
                ?expected,
                "Reconstructed size differs from the nominal output size"
            );
            return Err(PipelineError::InvalidGeometry(format!(
                "upscaled frame {width}x{height} crops to {out_w}x{out_h}, expected {}x{}",
                expected.0, expected.1
            )));
        }

        let cropped;
        let visible = if crop_right == 0 && crop_bottom == 0 {
            frame
        } else {
            cropped = crop_frame(frame, out_w, out_h)?;
            &cropped
        };
        Ok(self.converter.convert(visible, &self.target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::RgbConverter;
    use crate::error::ConversionError;
    use crate::types::{ColorMatrix, ColorSpec, PixelFormat};

    fn reconstructor(
        padding: PaddingSpec,
        scale: u32,
        original: (u32, u32),
    ) -> OutputReconstructor {
        OutputReconstructor::new(
            padding,
            scale,
            original,
            ConversionTarget::packed(16, ColorSpec::default()),
            Arc::new(RgbConverter),
        )
    }

    fn upscaled(width: u32, height: u32) -> Frame {
        let data = vec![0.5; 3 * (width * height) as usize];
        Frame::planar_f32(width, height, ColorSpec::default(), data).unwrap()
    }

    #[test]
    fn crops_scaled_padding_and_converts() {
        // 100x50 source, padded to 128x64, upscaled x4.
        let r = reconstructor(PaddingSpec { right: 28, bottom: 14 }, 4, (100, 50));
        assert_eq!(r.crop_amounts(), (112, 56));

        let frame = r.reconstruct(&upscaled(512, 256)).unwrap();
        assert_eq!(frame.dims(), (400, 200));
        assert_eq!(frame.format(), PixelFormat::PackedRgb);
        assert_eq!(frame.bit_depth(), 16);
    }

    #[test]
    fn zero_padding_only_converts() {
        let r = reconstructor(PaddingSpec::default(), 2, (4, 4));
        let frame = r.reconstruct(&upscaled(8, 8)).unwrap();
        assert_eq!(frame.dims(), (8, 8));
        assert_eq!(r.output_dims(), (8, 8));
    }

    #[test]
    fn crop_beyond_extent_is_rejected() {
        let r = reconstructor(PaddingSpec { right: 10, bottom: 0 }, 4, (1, 1));
        match r.reconstruct(&upscaled(40, 40)) {
            Err(PipelineError::CropOutOfBounds {
                crop_right, width, ..
            }) => {
                assert_eq!(crop_right, 40);
                assert_eq!(width, 40);
            }
            other => panic!("expected CropOutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn frame_not_matching_nominal_size_is_rejected() {
        let r = reconstructor(PaddingSpec::default(), 2, (4, 4));
        match r.reconstruct(&upscaled(10, 6)) {
            Err(PipelineError::InvalidGeometry(message)) => {
                assert!(message.contains("expected 8x8"), "{message}");
            }
            other => panic!("expected InvalidGeometry, got {other:?}"),
        }

        // Padding that does not match the frame leaves the wrong size too.
        let r = reconstructor(PaddingSpec { right: 2, bottom: 0 }, 2, (4, 4));
        assert!(matches!(
            r.reconstruct(&upscaled(8, 8)),
            Err(PipelineError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn conversion_errors_pass_through() {
        let r = OutputReconstructor::new(
            PaddingSpec::default(),
            1,
            (2, 2),
            ConversionTarget::packed(
                8,
                ColorSpec {
                    matrix: ColorMatrix::Bt601,
                    ..ColorSpec::default()
                },
            ),
            Arc::new(RgbConverter),
        );

        match r.reconstruct(&upscaled(2, 2)) {
            Err(PipelineError::FormatConversion(ConversionError::UnsupportedMatrix { .. })) => {}
            other => panic!("expected matrix error, got {other:?}"),
        }
    }
}
