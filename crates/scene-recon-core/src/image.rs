/// Borrowed 8-bit grayscale image, row-major, `data.len() == width * height`.
///
/// Pixel centers sit at integer coordinates.
#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8],
}

/// Owned 8-bit grayscale image.
#[derive(Clone, Debug, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize, fill: u8) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    pub fn view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }
}

impl<'a> GrayImageView<'a> {
    /// Build a view, checking the buffer length.
    pub fn try_new(width: usize, height: usize, data: &'a [u8]) -> Option<Self> {
        (width.checked_mul(height)? == data.len()).then_some(Self {
            width,
            height,
            data,
        })
    }

    /// Pixel value; zero outside the image.
    #[inline]
    pub fn get(&self, x: i64, y: i64) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return 0;
        }
        self.data[y as usize * self.width + x as usize]
    }

    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= (self.width as f64 - 1.0) && y <= (self.height as f64 - 1.0)
    }

    /// Bilinear interpolation.
    #[inline]
    pub fn sample_bilinear(&self, x: f64, y: f64) -> f64 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (ix, iy) = (x0 as i64, y0 as i64);

        let p00 = self.get(ix, iy) as f64;
        let p10 = self.get(ix + 1, iy) as f64;
        let p01 = self.get(ix, iy + 1) as f64;
        let p11 = self.get(ix + 1, iy + 1) as f64;

        let a = p00 + fx * (p10 - p00);
        let b = p01 + fx * (p11 - p01);
        a + fy * (b - a)
    }

    /// Mean of the 3x3 neighbourhood around the pixel containing `(x, y)`;
    /// `None` if any of it falls outside the image.
    pub fn mean_3x3(&self, x: f64, y: f64) -> Option<u8> {
        let ix = x.round() as i64;
        let iy = y.round() as i64;
        if ix < 1 || iy < 1 || ix + 1 >= self.width as i64 || iy + 1 >= self.height as i64 {
            return None;
        }
        let mut sum = 0u32;
        for dy in -1..=1 {
            for dx in -1..=1 {
                sum += self.get(ix + dx, iy + dy) as u32;
            }
        }
        Some((sum / 9) as u8)
    }
}
