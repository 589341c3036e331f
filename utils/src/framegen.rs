use log::trace;
use thiserror::Error;
use wlsink::pool::{ForeignFrame, ForeignPlane, FrameBufferHandle};
use wlsink::{FrameLayout, LayoutError, PixelFormat};

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("Invalid frame layout: {0}")]
    InvalidLayout(#[from] LayoutError),
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("Buffer is {0}x{1} {2}, which does not match the generator")]
    LayoutMismatch(u32, u32, PixelFormat),
}

/// A frame generated in memory owned by the generator.
pub struct GeneratedFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Data and stride of each plane.
    pub planes: Vec<(Vec<u8>, usize)>,
}

impl GeneratedFrame {
    /// Borrow this frame so it can be handed to a sink.
    pub fn as_foreign(&self) -> ForeignFrame<'_> {
        ForeignFrame {
            format: self.format,
            width: self.width,
            height: self.height,
            planes: self
                .planes
                .iter()
                .map(|(data, stride)| ForeignPlane {
                    data,
                    stride: *stride,
                })
                .collect(),
        }
    }
}

/// Generates a moving test pattern.
pub struct FrameGenerator {
    layout: FrameLayout,
    step: u32,
}

impl FrameGenerator {
    /// Create a generator of `width`x`height` frames of `format`. Frames
    /// generated with `next_frame` have their lines aligned to 4 bytes.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Result<Self, NewFrameGeneratorError> {
        Ok(FrameGenerator {
            layout: FrameLayout::new(format, width, height, 4)?,
            step: 0,
        })
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn frame_size(&self) -> usize {
        self.layout.size()
    }

    /// Write the next frame into a buffer acquired from a sink.
    pub fn fill_buffer(&mut self, handle: &mut FrameBufferHandle) -> Result<(), GenerateFrameError> {
        let layout = handle.layout();
        if layout.format != self.layout.format
            || layout.width != self.layout.width
            || layout.height != self.layout.height
        {
            return Err(GenerateFrameError::LayoutMismatch(
                layout.width,
                layout.height,
                layout.format,
            ));
        }

        // The buffer may use other strides than ours.
        let planes = layout.planes.clone();
        for (i, plane) in planes.iter().enumerate() {
            self.gen_plane(i, handle.plane_mut(i), plane.stride, plane.line_bytes);
        }
        trace!("Generated frame {} into buffer {}", self.step, handle.index());
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    /// Generate the next frame in newly allocated memory.
    pub fn next_frame(&mut self) -> GeneratedFrame {
        let planes = self
            .layout
            .planes
            .iter()
            .enumerate()
            .map(|(i, plane)| {
                let mut data = vec![0u8; plane.size];
                self.gen_plane(i, &mut data, plane.stride, plane.line_bytes);
                (data, plane.stride)
            })
            .collect();
        self.step = self.step.wrapping_add(1);

        GeneratedFrame {
            format: self.layout.format,
            width: self.layout.width,
            height: self.layout.height,
            planes,
        }
    }

    fn gen_plane(&self, plane: usize, data: &mut [u8], stride: usize, line_bytes: usize) {
        let lines = data
            .chunks_mut(stride)
            .map(|l| &mut l[0..line_bytes])
            .enumerate();

        match (self.layout.format, plane) {
            (PixelFormat::BGRA, _) | (PixelFormat::BGRX, _) => lines.for_each(|(y, line)| {
                line.chunks_exact_mut(4).enumerate().for_each(|(x, pixel)| {
                    let bgr = self.step.wrapping_add((x ^ y) as u32).to_le_bytes();
                    pixel[0..3].copy_from_slice(&bgr[0..3]);
                    pixel[3] = 0xff;
                });
            }),
            // Luma
            (_, 0) => lines.for_each(|(y, line)| {
                line.iter_mut().enumerate().for_each(|(x, sample)| {
                    *sample = self.step.wrapping_add((x ^ y) as u32) as u8;
                });
            }),
            // Chroma slowly drifting away from grey.
            _ => {
                let value = 0x80u8.wrapping_add((self.step / 4) as u8);
                lines.for_each(|(_, line)| line.fill(value));
            }
        }
    }
}
