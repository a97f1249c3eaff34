//! Samples flowing between pipeline elements.
//!
//! The set of fields a sample carries is fixed by the pair of elements exchanging it: sources emit bare images,
//! detectors emit images annotated with detections. [`Sample`] encodes exactly those shapes, plus an explicit
//! [`Sample::Empty`] marker that elements forward when they have nothing to report so that the end of the chain still
//! sees activity.

use bytes::Bytes;
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Errors produced when constructing or transforming image frames.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum SampleError {
    /// Frame payload did not match the declared geometry.
    #[snafu(display(
        "Frame payload is {} bytes, expected {} for {}x{} {:?}.",
        actual,
        expected,
        width,
        height,
        format
    ))]
    InvalidFrameSize {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Declared pixel format.
        format: PixelFormat,
        /// Expected payload length.
        expected: usize,
        /// Actual payload length.
        actual: usize,
    },

    /// A frame with no pixels.
    #[snafu(display("Frame dimensions must be non-zero, got {}x{}.", width, height))]
    EmptyFrame {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
    },

    /// Crop region does not cover any pixel of the frame.
    #[snafu(display("Crop region {:?} does not overlap the frame.", region))]
    EmptyRegion {
        /// Requested region.
        region: BoundingBox,
    },
}

/// Pixel layout of a raw frame.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 8-bit red, green, blue.
    #[default]
    Rgb24,

    /// 8-bit luminance.
    Gray8,
}

impl PixelFormat {
    /// Bytes used by a single pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Gray8 => 1,
        }
    }

    /// Name of the format as understood by `ffmpeg -pix_fmt`.
    pub const fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Rgb24 => "rgb24",
            Self::Gray8 => "gray",
        }
    }
}

/// A raw, uncompressed image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl ImageFrame {
    /// Creates a new `ImageFrame`, validating the payload length against the geometry.
    ///
    /// # Errors
    ///
    /// If either dimension is zero, or the payload length does not equal `width * height * bytes_per_pixel`, an error
    /// is returned.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Bytes) -> Result<Self, SampleError> {
        if width == 0 || height == 0 {
            return Err(SampleError::EmptyFrame { width, height });
        }

        let expected = Self::frame_len(width, height, format);
        if data.len() != expected {
            return Err(SampleError::InvalidFrameSize {
                width,
                height,
                format,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Number of bytes in a frame of the given geometry.
    pub const fn frame_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw pixel data, row-major with no padding.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Creates a new `ImageFrame` from a decoded image, converting it to `format`.
    ///
    /// # Errors
    ///
    /// If the image has no pixels, an error is returned.
    pub fn from_image(image: &DynamicImage, format: PixelFormat) -> Result<Self, SampleError> {
        let data = match format {
            PixelFormat::Rgb24 => image.to_rgb8().into_raw(),
            PixelFormat::Gray8 => image.to_luma8().into_raw(),
        };
        Self::new(image.width(), image.height(), format, Bytes::from(data))
    }

    /// Copies the frame into an image buffer of the matching color type.
    pub fn to_image(&self) -> DynamicImage {
        let data = self.data.to_vec();
        let image = match self.format {
            PixelFormat::Rgb24 => RgbImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageRgb8),
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageLuma8),
        };

        // The payload length is checked against the geometry on construction, so the buffer always fits.
        image.unwrap_or_else(|| match self.format {
            PixelFormat::Rgb24 => DynamicImage::new_rgb8(self.width, self.height),
            PixelFormat::Gray8 => DynamicImage::new_luma8(self.width, self.height),
        })
    }

    /// Copies out the region covered by a normalized bounding box.
    ///
    /// Box coordinates are clamped to the frame. Partially covered pixels on the edges are included.
    ///
    /// # Errors
    ///
    /// If the clamped region is empty, an error is returned.
    pub fn crop(&self, region: &BoundingBox) -> Result<ImageFrame, SampleError> {
        let scale = |value: f32, limit: u32, round_up: bool| {
            let scaled = value.clamp(0.0, 1.0) * limit as f32;
            let rounded = if round_up { scaled.ceil() } else { scaled.floor() };
            (rounded as u32).min(limit)
        };

        let x0 = scale(region.xmin, self.width, false);
        let x1 = scale(region.xmax, self.width, true);
        let y0 = scale(region.ymin, self.height, false);
        let y1 = scale(region.ymax, self.height, true);
        if x1 <= x0 || y1 <= y0 {
            return Err(SampleError::EmptyRegion { region: *region });
        }

        let cropped = self.to_image().crop_imm(x0, y0, x1 - x0, y1 - y0);
        ImageFrame::from_image(&cropped, self.format)
    }
}

/// A bounding box in normalized image coordinates (0.0 to 1.0).
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BoundingBox {
    /// Left edge.
    pub xmin: f32,
    /// Top edge.
    pub ymin: f32,
    /// Right edge.
    pub xmax: f32,
    /// Bottom edge.
    pub ymax: f32,
}

impl BoundingBox {
    /// Creates a new `BoundingBox` from `(x0, y0, x1, y1)`.
    pub const fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }
}

/// A labeled detection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    /// Class label.
    pub label: String,
    /// Confidence score, 0.0 to 1.0.
    pub confidence: f32,
    /// Where in the image the detection is.
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// Describes how a set of detections was produced.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InferenceMeta {
    /// Human readable name of the detection stage.
    pub display: String,
}

/// An image together with the detections found in it.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSample {
    /// The analyzed image.
    pub image: ImageFrame,
    /// Detections above the detector's threshold, possibly empty.
    pub detections: Vec<Detection>,
    /// Details about the detector.
    pub meta: InferenceMeta,
}

/// One unit of data flowing through a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    /// Nothing to report; forwarded so the end of the chain still records activity.
    Empty,

    /// A captured frame.
    Image(ImageFrame),

    /// A frame with detection results.
    Detections(DetectionSample),
}

impl Sample {
    /// Returns `true` if this is the empty marker.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The image carried by the sample, if any.
    pub fn image(&self) -> Option<&ImageFrame> {
        match self {
            Self::Empty => None,
            Self::Image(image) => Some(image),
            Self::Detections(sample) => Some(&sample.image),
        }
    }

    /// Short name of the sample shape, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Image(_) => "image",
            Self::Detections(_) => "detections",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> ImageFrame {
        let data = (0..width * height)
            .flat_map(|i| [i as u8, (i >> 8) as u8, 0])
            .collect::<Vec<u8>>();
        ImageFrame::new(width, height, PixelFormat::Rgb24, Bytes::from(data)).unwrap()
    }

    #[test]
    fn frame_length_is_validated() {
        let error = ImageFrame::new(2, 2, PixelFormat::Rgb24, Bytes::from_static(&[0; 11])).unwrap_err();
        assert_eq!(
            error,
            SampleError::InvalidFrameSize {
                width: 2,
                height: 2,
                format: PixelFormat::Rgb24,
                expected: 12,
                actual: 11
            }
        );

        assert!(ImageFrame::new(2, 2, PixelFormat::Gray8, Bytes::from_static(&[0; 4])).is_ok());
        assert!(matches!(
            ImageFrame::new(0, 2, PixelFormat::Gray8, Bytes::new()),
            Err(SampleError::EmptyFrame { .. })
        ));
    }

    #[test]
    fn crop_copies_covered_rows() {
        let frame = gradient(4, 4);
        let cropped = frame.crop(&BoundingBox::new(0.5, 0.25, 1.0, 0.75)).unwrap();

        assert_eq!((cropped.width(), cropped.height()), (2, 2));
        // Pixel (2, 1) of the source is index 6, pixel (3, 2) is index 11.
        assert_eq!(cropped.data()[0], 6);
        assert_eq!(cropped.data()[cropped.data().len() - 3], 11);
    }

    #[test]
    fn crop_clamps_and_rejects_empty_regions() {
        let frame = gradient(4, 4);
        let clamped = frame.crop(&BoundingBox::new(-0.5, -0.5, 2.0, 2.0)).unwrap();
        assert_eq!(clamped, frame);

        assert!(matches!(
            frame.crop(&BoundingBox::new(0.5, 0.5, 0.5, 0.9)),
            Err(SampleError::EmptyRegion { .. })
        ));
    }

    #[test]
    fn frames_convert_to_and_from_image_buffers() {
        let frame = gradient(3, 2);
        let image = frame.to_image();
        assert_eq!((image.width(), image.height()), (3, 2));
        assert_eq!(image.as_rgb8().unwrap().get_pixel(2, 1).0, [5, 0, 0]);
        assert_eq!(ImageFrame::from_image(&image, PixelFormat::Rgb24).unwrap(), frame);

        let gray = ImageFrame::from_image(&image, PixelFormat::Gray8).unwrap();
        assert_eq!(gray.format(), PixelFormat::Gray8);
        assert_eq!(gray.data().len(), 6);
    }

    #[test]
    fn detections_serialize_box_field() {
        let detection = Detection {
            label: "person".to_string(),
            confidence: 0.5,
            bbox: BoundingBox::new(0.0, 0.25, 0.5, 1.0),
        };
        let value = serde_json::to_value(&detection).unwrap();
        assert_eq!(value["box"]["ymin"], 0.25);
        assert_eq!(value["label"], "person");
    }
}
