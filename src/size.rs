/// Pixel dimensions of an image or a resize target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Computes the output dimensions for a thumbnail. Never upscales: a
/// requested dimension at or beyond the natural one leaves the image at its
/// natural size on that axis. When both dimensions are requested the smaller
/// reduction ratio wins and both axes are rounded independently
/// (half away from zero).
pub fn resolve(requested_width: Option<u32>, requested_height: Option<u32>, natural: ImageSize) -> ImageSize {
    let mut width = natural.width;
    let mut height = natural.height;

    match (requested_width, requested_height) {
        (None, None) => {}
        (Some(req_width), None) => {
            if req_width < natural.width {
                width = req_width;
                height = scale(natural.height, req_width, natural.width);
            }
        }
        (None, Some(req_height)) => {
            if req_height < natural.height {
                width = scale(natural.width, req_height, natural.height);
                height = req_height;
            }
        }
        (Some(req_width), Some(req_height)) => {
            if req_width < natural.width || req_height < natural.height {
                let width_ratio = f64::from(req_width) / f64::from(natural.width);
                let height_ratio = f64::from(req_height) / f64::from(natural.height);
                let ratio = width_ratio.min(height_ratio);

                width = (f64::from(natural.width) * ratio).round() as u32;
                height = (f64::from(natural.height) * ratio).round() as u32;
            }
        }
    }

    ImageSize { width, height }
}

fn scale(dimension: u32, numerator: u32, denominator: u32) -> u32 {
    (f64::from(dimension) * f64::from(numerator) / f64::from(denominator)).round() as u32
}
