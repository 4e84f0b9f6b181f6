use crate::io::raster::{RasterSink, RasterSource};
use crate::types::{CalcError, CalcResult, GeoTransform, PixelType};
use gdal::raster::{Buffer, GdalType};
use gdal::{Dataset, DriverManager};
use ndarray::{ArrayView2, ArrayView3, ArrayViewMut3, Axis};
use std::path::{Path, PathBuf};
use std::sync::Once;

static REGISTER_DRIVERS: Once = Once::new();

/// Register all GDAL drivers once per process
pub fn ensure_drivers_registered() {
    REGISTER_DRIVERS.call_once(|| {
        log::debug!("Registering GDAL drivers");
        DriverManager::register_all();
    });
}

/// GDAL-backed input dataset
pub struct GdalRaster {
    dataset: Dataset,
    name: String,
    rows: usize,
    cols: usize,
    bands: usize,
    geo_transform: Option<GeoTransform>,
    nodata: Option<f64>,
}

impl GdalRaster {
    /// Open a raster file for reading
    pub fn open<P: AsRef<Path>>(path: P) -> CalcResult<Self> {
        ensure_drivers_registered();
        log::info!("Opening raster: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let (cols, rows) = dataset.raster_size();
        let bands = dataset.raster_count() as usize;
        if bands == 0 {
            return Err(CalcError::Dataset(format!(
                "{} has no raster bands",
                path.as_ref().display()
            )));
        }

        let geo_transform = dataset.geo_transform().ok().map(GeoTransform::from_gdal);
        let nodata = dataset.rasterband(1)?.no_data_value();

        log::debug!("Raster size: {}x{} with {} bands", cols, rows, bands);
        log::debug!("Raster geotransform: {:?}", geo_transform);

        Ok(Self {
            dataset,
            name: path.as_ref().display().to_string(),
            rows,
            cols,
            bands,
            geo_transform,
            nodata,
        })
    }

    pub fn projection(&self) -> String {
        self.dataset.projection()
    }
}

impl RasterSource for GdalRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn band_count(&self) -> usize {
        self.bands
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo_transform
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn read_rows(&mut self, row_offset: usize, mut dest: ArrayViewMut3<'_, f64>) -> CalcResult<()> {
        let (bands, rows, cols) = dest.dim();
        if bands != self.bands || cols != self.cols || row_offset + rows > self.rows {
            return Err(CalcError::Dataset(format!(
                "Requested strip {}x{}x{} at row {} is outside '{}'",
                bands, rows, cols, row_offset, self.name
            )));
        }

        for (idx, mut band_view) in dest.axis_iter_mut(Axis(0)).enumerate() {
            let band = self.dataset.rasterband(idx as isize + 1)?;
            let buffer = band.read_as::<f64>(
                (0, row_offset as isize),
                (cols, rows),
                (cols, rows),
                None,
            )?;
            let strip = ArrayView2::from_shape((rows, cols), &buffer.data).map_err(|e| {
                CalcError::Dataset(format!("Failed to reshape band {} strip: {}", idx + 1, e))
            })?;
            band_view.assign(&strip);
        }
        Ok(())
    }
}

/// Options for creating an output dataset
#[derive(Debug, Clone)]
pub struct OutputOptions {
    /// GDAL driver short name, e.g. "GTiff" or "KEA"
    pub format: String,
    pub pixel_type: PixelType,
    pub nodata: Option<f64>,
    pub geo_transform: Option<GeoTransform>,
    pub projection: Option<String>,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            format: "GTiff".to_string(),
            pixel_type: PixelType::Float32,
            nodata: None,
            geo_transform: None,
            projection: None,
        }
    }
}

/// GDAL-backed output dataset, flushed and closed on drop
pub struct GdalRasterWriter {
    dataset: Dataset,
    path: PathBuf,
    pixel_type: PixelType,
    rows: usize,
    cols: usize,
    bands: usize,
}

impl GdalRasterWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        bands: usize,
        rows: usize,
        cols: usize,
        options: &OutputOptions,
    ) -> CalcResult<Self> {
        ensure_drivers_registered();
        log::info!(
            "Creating {} output raster ({}): {}",
            options.format,
            options.pixel_type,
            path.as_ref().display()
        );

        let driver = DriverManager::get_driver_by_name(&options.format)?;
        let (w, h, n) = (cols as isize, rows as isize, bands as isize);
        let p = path.as_ref();
        let mut dataset = match options.pixel_type {
            PixelType::Byte => driver.create_with_band_type::<u8, _>(p, w, h, n)?,
            PixelType::Int16 => driver.create_with_band_type::<i16, _>(p, w, h, n)?,
            PixelType::UInt16 => driver.create_with_band_type::<u16, _>(p, w, h, n)?,
            PixelType::Int32 => driver.create_with_band_type::<i32, _>(p, w, h, n)?,
            PixelType::UInt32 => driver.create_with_band_type::<u32, _>(p, w, h, n)?,
            PixelType::Float32 => driver.create_with_band_type::<f32, _>(p, w, h, n)?,
            PixelType::Float64 => driver.create_with_band_type::<f64, _>(p, w, h, n)?,
        };

        if let Some(gt) = options.geo_transform {
            dataset.set_geo_transform(&gt.to_gdal())?;
        }
        if let Some(projection) = &options.projection {
            dataset.set_projection(projection)?;
        }
        if options.nodata.is_some() {
            for band in 1..=bands {
                dataset
                    .rasterband(band as isize)?
                    .set_no_data_value(options.nodata)?;
            }
        }

        Ok(Self {
            dataset,
            path: p.to_path_buf(),
            pixel_type: options.pixel_type,
            rows,
            cols,
            bands,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_band<T>(&mut self, band: usize, row_offset: usize, values: ArrayView2<'_, f64>) -> CalcResult<()>
    where
        T: GdalType + Copy + num_traits::NumCast + num_traits::Zero,
    {
        let (rows, cols) = values.dim();
        let pixel_type = self.pixel_type;
        let data: Vec<T> = values
            .iter()
            .map(|&v| num_traits::cast(pixel_type.quantize(v)).unwrap_or_else(T::zero))
            .collect();
        let buffer = Buffer::new((cols, rows), data);
        let mut raster_band = self.dataset.rasterband(band as isize + 1)?;
        raster_band.write((0, row_offset as isize), (cols, rows), &buffer)?;
        Ok(())
    }
}

impl RasterSink for GdalRasterWriter {
    fn size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn band_count(&self) -> usize {
        self.bands
    }

    fn write_rows(&mut self, row_offset: usize, data: ArrayView3<'_, f64>) -> CalcResult<()> {
        let (bands, rows, cols) = data.dim();
        if bands != self.bands || cols != self.cols || row_offset + rows > self.rows {
            return Err(CalcError::Dataset(format!(
                "Output strip {}x{}x{} at row {} is outside '{}'",
                bands,
                rows,
                cols,
                row_offset,
                self.path.display()
            )));
        }

        for (band, values) in data.axis_iter(Axis(0)).enumerate() {
            match self.pixel_type {
                PixelType::Byte => self.write_band::<u8>(band, row_offset, values)?,
                PixelType::Int16 => self.write_band::<i16>(band, row_offset, values)?,
                PixelType::UInt16 => self.write_band::<u16>(band, row_offset, values)?,
                PixelType::Int32 => self.write_band::<i32>(band, row_offset, values)?,
                PixelType::UInt32 => self.write_band::<u32>(band, row_offset, values)?,
                PixelType::Float32 => self.write_band::<f32>(band, row_offset, values)?,
                PixelType::Float64 => self.write_band::<f64>(band, row_offset, values)?,
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> CalcResult<()> {
        // GDAL flushes the block cache when the dataset handle is dropped
        log::debug!("Finished writing {}", self.path.display());
        Ok(())
    }
}
