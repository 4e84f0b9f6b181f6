use crate::types::{BandCube, BandImage, CalcError, CalcResult, GeoTransform, PixelType};
use ndarray::{s, Array3, ArrayView2, ArrayView3, ArrayViewMut3, Axis};

/// A co-registered multi-band raster that can be read in row strips
pub trait RasterSource {
    /// Human readable name used in log and error messages
    fn name(&self) -> &str;

    /// Raster dimensions as (rows, cols)
    fn size(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    fn geo_transform(&self) -> Option<GeoTransform> {
        None
    }

    /// Nodata value declared by the dataset itself, if any
    fn nodata(&self) -> Option<f64> {
        None
    }

    /// Read `dest.shape()[1]` rows starting at `row_offset` for every band.
    ///
    /// `dest` is laid out as (band, row, col) and must have exactly
    /// `band_count()` bands and `size().1` columns.
    fn read_rows(&mut self, row_offset: usize, dest: ArrayViewMut3<'_, f64>) -> CalcResult<()>;
}

/// Destination for calculated output strips
pub trait RasterSink {
    fn size(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    /// Write a (band, row, col) strip starting at `row_offset`
    fn write_rows(&mut self, row_offset: usize, data: ArrayView3<'_, f64>) -> CalcResult<()>;

    fn flush(&mut self) -> CalcResult<()> {
        Ok(())
    }
}

/// In-memory raster used for tests, bindings and intermediate products
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    name: String,
    data: BandCube,
    pixel_type: PixelType,
    geo_transform: Option<GeoTransform>,
    nodata: Option<f64>,
}

impl MemoryRaster {
    /// Wrap an existing (band, row, col) cube stored as Float64
    pub fn from_cube(name: &str, data: BandCube) -> Self {
        Self {
            name: name.to_string(),
            data,
            pixel_type: PixelType::Float64,
            geo_transform: None,
            nodata: None,
        }
    }

    /// Single band raster from a 2D image
    pub fn from_image(name: &str, image: BandImage) -> Self {
        Self::from_cube(name, image.insert_axis(Axis(0)))
    }

    /// Single band raster from row-major values
    pub fn from_rows(name: &str, rows: usize, cols: usize, values: Vec<f64>) -> CalcResult<Self> {
        let image = BandImage::from_shape_vec((rows, cols), values).map_err(|e| {
            CalcError::Dataset(format!("Failed to shape {} values as {}x{}: {}", name, rows, cols, e))
        })?;
        Ok(Self::from_image(name, image))
    }

    /// Empty output raster with the given storage type
    pub fn new(name: &str, bands: usize, rows: usize, cols: usize, pixel_type: PixelType) -> Self {
        Self {
            name: name.to_string(),
            data: Array3::zeros((bands, rows, cols)),
            pixel_type,
            geo_transform: None,
            nodata: None,
        }
    }

    pub fn with_geo_transform(mut self, geo_transform: GeoTransform) -> Self {
        self.geo_transform = Some(geo_transform);
        self
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn data(&self) -> &BandCube {
        &self.data
    }

    pub fn band(&self, band: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), band)
    }

    pub fn into_cube(self) -> BandCube {
        self.data
    }
}

impl RasterSource for MemoryRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    fn band_count(&self) -> usize {
        self.data.dim().0
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo_transform
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn read_rows(&mut self, row_offset: usize, mut dest: ArrayViewMut3<'_, f64>) -> CalcResult<()> {
        let (bands, rows, cols) = dest.dim();
        check_window(&self.name, self.data.dim(), row_offset, (bands, rows, cols))?;
        dest.assign(&self.data.slice(s![.., row_offset..row_offset + rows, ..]));
        Ok(())
    }
}

impl RasterSink for MemoryRaster {
    fn size(&self) -> (usize, usize) {
        RasterSource::size(self)
    }

    fn band_count(&self) -> usize {
        self.data.dim().0
    }

    fn write_rows(&mut self, row_offset: usize, data: ArrayView3<'_, f64>) -> CalcResult<()> {
        let (bands, rows, cols) = data.dim();
        check_window(&self.name, self.data.dim(), row_offset, (bands, rows, cols))?;
        let pixel_type = self.pixel_type;
        let mut target = self.data.slice_mut(s![.., row_offset..row_offset + rows, ..]);
        target.zip_mut_with(&data, |out, &value| *out = pixel_type.quantize(value));
        Ok(())
    }
}

fn check_window(
    name: &str,
    (bands, rows, cols): (usize, usize, usize),
    row_offset: usize,
    (req_bands, req_rows, req_cols): (usize, usize, usize),
) -> CalcResult<()> {
    if req_bands != bands || req_cols != cols || row_offset + req_rows > rows {
        return Err(CalcError::Dataset(format!(
            "Strip of {}x{}x{} at row {} does not fit raster '{}' of {}x{}x{}",
            req_bands, req_rows, req_cols, row_offset, name, bands, rows, cols
        )));
    }
    Ok(())
}

/// Ordered set of co-registered datasets presented as one band list.
///
/// Owns every dataset for the duration of a run; dropping the stack
/// releases them all, including when a run aborts part way through.
pub struct RasterStack {
    datasets: Vec<Box<dyn RasterSource>>,
    rows: usize,
    cols: usize,
    band_count: usize,
}

impl RasterStack {
    /// Build a stack, requiring every dataset to share the same pixel grid.
    ///
    /// Datasets carrying a geotransform must match the first one's origin and
    /// pixel size; datasets without one are accepted as-is.
    pub fn new(datasets: Vec<Box<dyn RasterSource>>) -> CalcResult<Self> {
        let first = datasets
            .first()
            .ok_or_else(|| CalcError::Dataset("No input datasets were provided".to_string()))?;
        let (rows, cols) = first.size();
        if rows == 0 || cols == 0 {
            return Err(CalcError::Dataset(format!(
                "Dataset '{}' has invalid dimensions {}x{}",
                first.name(),
                rows,
                cols
            )));
        }

        let mut band_count = 0;
        let mut reference: Option<(&str, GeoTransform)> = None;
        for dataset in &datasets {
            if dataset.size() != (rows, cols) {
                let (r, c) = dataset.size();
                return Err(CalcError::Dataset(format!(
                    "Dataset '{}' is {}x{} but the stack is {}x{}",
                    dataset.name(),
                    r,
                    c,
                    rows,
                    cols
                )));
            }
            if dataset.band_count() == 0 {
                return Err(CalcError::Dataset(format!(
                    "Dataset '{}' has no bands",
                    dataset.name()
                )));
            }
            if let Some(gt) = dataset.geo_transform() {
                match reference {
                    Some((name, ref_gt)) if !ref_gt.aligned_with(&gt) => {
                        return Err(CalcError::Dataset(format!(
                            "Dataset '{}' (origin {}, {}; pixel {} x {}) is not aligned with '{}' (origin {}, {}; pixel {} x {})",
                            dataset.name(),
                            gt.top_left_x,
                            gt.top_left_y,
                            gt.pixel_width,
                            gt.pixel_height,
                            name,
                            ref_gt.top_left_x,
                            ref_gt.top_left_y,
                            ref_gt.pixel_width,
                            ref_gt.pixel_height
                        )));
                    }
                    Some(_) => {}
                    None => reference = Some((dataset.name(), gt)),
                }
            }
            band_count += dataset.band_count();
        }

        log::debug!(
            "Raster stack: {} datasets, {} bands, {}x{} pixels",
            datasets.len(),
            band_count,
            rows,
            cols
        );

        Ok(Self {
            datasets,
            rows,
            cols,
            band_count,
        })
    }

    /// Convenience constructor for a single dataset
    pub fn single<R: RasterSource + 'static>(dataset: R) -> CalcResult<Self> {
        Self::new(vec![Box::new(dataset)])
    }

    /// (rows, cols)
    pub fn size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of bands over all datasets
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    /// Geotransform of the first dataset that declares one
    pub fn geo_transform(&self) -> Option<GeoTransform> {
        self.datasets.iter().find_map(|d| d.geo_transform())
    }

    /// Map a stack band index to (dataset index, band within dataset)
    pub fn band_location(&self, band: usize) -> CalcResult<(usize, usize)> {
        let mut offset = 0;
        for (idx, dataset) in self.datasets.iter().enumerate() {
            if band < offset + dataset.band_count() {
                return Ok((idx, band - offset));
            }
            offset += dataset.band_count();
        }
        Err(CalcError::Configuration(format!(
            "Band {} is out of range for a stack of {} bands",
            band, self.band_count
        )))
    }

    /// Read rows of all datasets, concatenating their bands into `dest`
    pub fn read_rows(&mut self, row_offset: usize, mut dest: ArrayViewMut3<'_, f64>) -> CalcResult<()> {
        let mut band_offset = 0;
        for dataset in self.datasets.iter_mut() {
            let n = dataset.band_count();
            let view = dest.slice_mut(s![band_offset..band_offset + n, .., ..]);
            dataset.read_rows(row_offset, view)?;
            band_offset += n;
        }
        Ok(())
    }
}

impl Drop for RasterStack {
    fn drop(&mut self) {
        log::debug!("Releasing {} datasets", self.datasets.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_stack_concatenates_bands() {
        let a = MemoryRaster::from_image("a", Array2::from_elem((4, 3), 1.0));
        let b = MemoryRaster::from_cube("b", Array3::from_elem((2, 4, 3), 2.0));
        let mut stack = RasterStack::new(vec![Box::new(a), Box::new(b)]).unwrap();

        assert_eq!(stack.band_count(), 3);
        assert_eq!(stack.band_location(2).unwrap(), (1, 1));
        assert!(stack.band_location(3).is_err());

        let mut strip = Array3::zeros((3, 2, 3));
        stack.read_rows(1, strip.view_mut()).unwrap();
        assert_eq!(strip[[0, 0, 0]], 1.0);
        assert_eq!(strip[[2, 1, 2]], 2.0);
    }

    #[test]
    fn test_stack_rejects_misaligned_datasets() {
        let a = MemoryRaster::from_image("a", Array2::zeros((4, 3)));
        let b = MemoryRaster::from_image("b", Array2::zeros((5, 3)));
        let result = RasterStack::new(vec![Box::new(a), Box::new(b)]);
        assert!(matches!(result, Err(CalcError::Dataset(_))));
    }

    #[test]
    fn test_memory_sink_quantizes() {
        let mut out = MemoryRaster::new("out", 1, 2, 2, PixelType::Byte);
        let strip = Array3::from_shape_vec((1, 1, 2), vec![12.4, 400.0]).unwrap();
        out.write_rows(1, strip.view()).unwrap();
        assert_eq!(out.band(0)[[1, 0]], 12.0);
        assert_eq!(out.band(0)[[1, 1]], 255.0);

        let too_tall = Array3::zeros((1, 3, 2));
        assert!(out.write_rows(0, too_tall.view()).is_err());
    }
}
