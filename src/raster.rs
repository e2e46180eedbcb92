//! GeoTIFF rasters: one band per variable, georeferenced by an affine transform.
//!
//! Bands are the samples of a pixel-interleaved page (the layout
//! [`write_geotiff`] produces and GDAL emits for multi-band files) or come one
//! per page from multi-page files.

use crate::window::{AffineTransform, PixelWindow};
use log::debug;
use ndarray::{s, Array2};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::{PlanarConfiguration, SampleFormat, Tag};

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("{0} carries no georeferencing (ModelTransformation or PixelScale+Tiepoint)")]
    MissingGeoreference(PathBuf),

    #[error("Unsupported sample layout in {path}: {detail}")]
    UnsupportedLayout { path: PathBuf, detail: String },

    #[error("Band {band} requested but the raster has {count} band(s)")]
    BandOutOfRange { band: usize, count: usize },

    #[error("Window {window:?} does not fit inside a {rows}x{cols} raster")]
    WindowOutOfBounds {
        window: PixelWindow,
        rows: usize,
        cols: usize,
    },

    #[error("Bands must share one shape; got {expected:?} and {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Cannot write a raster with no bands")]
    NoBands,
}

pub type RasterResult<T> = Result<T, RasterError>;

/// A fully loaded multi-band GeoTIFF.
#[derive(Debug, Clone)]
pub struct GeoTiffRaster {
    rows: usize,
    cols: usize,
    transform: AffineTransform,
    bands: Vec<Array2<f32>>,
}

impl GeoTiffRaster {
    pub fn open<P: AsRef<Path>>(path: P) -> RasterResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| RasterError::Io {
            path: path.clone(),
            source,
        })?;
        let mut decoder = Decoder::new(BufReader::new(file))?;

        let transform =
            read_transform(&mut decoder)?.ok_or_else(|| RasterError::MissingGeoreference(path.clone()))?;
        let (width, height) = decoder.dimensions()?;
        let (rows, cols) = (height as usize, width as usize);

        let mut bands = Vec::new();
        loop {
            let (page_width, page_height) = decoder.dimensions()?;
            if (page_height as usize, page_width as usize) != (rows, cols) {
                return Err(RasterError::ShapeMismatch {
                    expected: (rows, cols),
                    found: (page_height as usize, page_width as usize),
                });
            }

            let samples = match decoder.read_image() {
                Ok(result) => decoding_result_to_f32(result, &path)?,
                // gray pages with extra samples have no tiff colour type
                Err(tiff::TiffError::UnsupportedError(_)) => read_interleaved_f32(&mut decoder, &path)?,
                Err(e) => return Err(e.into()),
            };
            let pixels = rows * cols;
            if pixels == 0 || samples.len() % pixels != 0 {
                return Err(RasterError::UnsupportedLayout {
                    path,
                    detail: format!("{} samples for {}x{} pixels", samples.len(), rows, cols),
                });
            }

            let per_pixel = samples.len() / pixels;
            for sample in 0..per_pixel {
                let band: Vec<f32> = samples.iter().skip(sample).step_by(per_pixel).copied().collect();
                let band = Array2::from_shape_vec((rows, cols), band).map_err(|e| {
                    RasterError::UnsupportedLayout {
                        path: path.clone(),
                        detail: e.to_string(),
                    }
                })?;
                bands.push(band);
            }

            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        debug!(
            "Opened {:?}: {} band(s), {}x{}, transform {:?}",
            path,
            bands.len(),
            rows,
            cols,
            transform
        );

        Ok(Self {
            rows,
            cols,
            transform,
            bands,
        })
    }

    pub fn transform(&self) -> &AffineTransform {
        &self.transform
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn band(&self, band: usize) -> RasterResult<&Array2<f32>> {
        self.bands.get(band).ok_or(RasterError::BandOutOfRange {
            band,
            count: self.bands.len(),
        })
    }

    /// Copies out one band's sub-window. Empty or partially outside windows are errors.
    pub fn read_window(&self, band: usize, window: &PixelWindow) -> RasterResult<Array2<f32>> {
        let data = self.band(band)?;
        if !window.fits_within(self.rows, self.cols) {
            return Err(RasterError::WindowOutOfBounds {
                window: *window,
                rows: self.rows,
                cols: self.cols,
            });
        }

        let r0 = window.row_off as usize;
        let c0 = window.col_off as usize;
        let r1 = r0 + window.height as usize;
        let c1 = c0 + window.width as usize;
        Ok(data.slice(s![r0..r1, c0..c1]).to_owned())
    }
}

fn read_transform<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
) -> RasterResult<Option<AffineTransform>> {
    if let Some(value) = decoder.find_tag(Tag::ModelTransformationTag)? {
        let m = value.into_f64_vec()?;
        if m.len() >= 8 {
            return Ok(Some(AffineTransform::new(m[0], m[1], m[3], m[4], m[5], m[7])));
        }
    }

    let scale = decoder.find_tag(Tag::ModelPixelScaleTag)?;
    let tiepoint = decoder.find_tag(Tag::ModelTiepointTag)?;
    match (scale, tiepoint) {
        (Some(scale), Some(tiepoint)) => {
            let scale = scale.into_f64_vec()?;
            let tie = tiepoint.into_f64_vec()?;
            if scale.len() < 2 || tie.len() < 6 {
                return Ok(None);
            }
            let (sx, sy) = (scale[0], scale[1]);
            let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
            Ok(Some(AffineTransform::new(sx, 0.0, x - i * sx, 0.0, -sy, y + j * sy)))
        }
        _ => Ok(None),
    }
}

/// Raw strips of an uncompressed, chunky, 32-bit float page.
fn read_interleaved_f32<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> RasterResult<Vec<f32>> {
    let unsupported = |detail: String| RasterError::UnsupportedLayout {
        path: path.to_path_buf(),
        detail,
    };
    let compression = decoder.find_tag_unsigned::<u16>(Tag::Compression)?.unwrap_or(1);
    let planar = decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?.unwrap_or(1);
    if compression != 1 || planar != PlanarConfiguration::Chunky.to_u16() {
        return Err(unsupported(format!(
            "compression {} with planar configuration {}",
            compression, planar
        )));
    }
    if decoder.find_tag(Tag::TileOffsets)?.is_some() {
        return Err(unsupported("tiled pages".to_string()));
    }
    let bits = decoder.find_tag_unsigned_vec::<u16>(Tag::BitsPerSample)?.unwrap_or_default();
    let formats = decoder.find_tag_unsigned_vec::<u16>(Tag::SampleFormat)?.unwrap_or_default();
    if bits.iter().any(|&b| b != 32) || formats.iter().any(|&f| f != SampleFormat::IEEEFP.to_u16()) {
        return Err(unsupported(format!("bits {:?} with sample formats {:?}", bits, formats)));
    }
    let offsets = decoder.get_tag_u64_vec(Tag::StripOffsets)?;
    let counts = decoder.get_tag_u64_vec(Tag::StripByteCounts)?;

    let io = |source: std::io::Error| RasterError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io)?;
    let mut byte_order = [0u8; 2];
    file.read_exact(&mut byte_order).map_err(io)?;
    let little_endian = &byte_order == b"II";

    let mut bytes = Vec::new();
    for (&offset, &count) in offsets.iter().zip(&counts) {
        let start = bytes.len();
        bytes.resize(start + count as usize, 0);
        file.seek(SeekFrom::Start(offset)).map_err(io)?;
        file.read_exact(&mut bytes[start..]).map_err(io)?;
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| {
            let word = [b[0], b[1], b[2], b[3]];
            if little_endian {
                f32::from_le_bytes(word)
            } else {
                f32::from_be_bytes(word)
            }
        })
        .collect())
}

fn decoding_result_to_f32(result: DecodingResult, path: &Path) -> RasterResult<Vec<f32>> {
    let values = match result {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(RasterError::UnsupportedLayout {
                path: path.to_path_buf(),
                detail: "unrecognised sample format".to_string(),
            });
        }
    };
    Ok(values)
}

/// Writes `bands` as a geographic (EPSG:4326) GeoTIFF: one float page with
/// one pixel-interleaved sample per band.
pub fn write_geotiff<P: AsRef<Path>>(
    path: P,
    bands: &[Array2<f32>],
    transform: &AffineTransform,
) -> RasterResult<()> {
    let path = path.as_ref();
    let first = bands.first().ok_or(RasterError::NoBands)?;
    let (rows, cols) = first.dim();
    if let Some(band) = bands.iter().find(|band| band.dim() != (rows, cols)) {
        return Err(RasterError::ShapeMismatch {
            expected: (rows, cols),
            found: band.dim(),
        });
    }
    let samples = bands.len();
    let samples_per_pixel = u16::try_from(samples).map_err(|_| RasterError::UnsupportedLayout {
        path: path.to_path_buf(),
        detail: format!("{} bands exceed the TIFF sample limit", samples),
    })?;

    let mut data = Vec::with_capacity(rows * cols * samples);
    for row in 0..rows {
        for col in 0..cols {
            data.extend(bands.iter().map(|band| band[[row, col]]));
        }
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| RasterError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;

    // The strips are laid out as a gray image `samples` times as wide; the
    // directory entries below describe them as `samples` bands per pixel.
    let mut image = encoder.new_image::<colortype::Gray32Float>((cols * samples) as u32, rows as u32)?;
    let directory = image.encoder();
    directory.write_tag(Tag::ImageWidth, cols as u32)?;
    directory.write_tag(Tag::SamplesPerPixel, samples_per_pixel)?;
    directory.write_tag(Tag::BitsPerSample, &vec![32u16; samples][..])?;
    directory.write_tag(Tag::SampleFormat, &vec![SampleFormat::IEEEFP.to_u16(); samples][..])?;
    directory.write_tag(Tag::PlanarConfiguration, PlanarConfiguration::Chunky.to_u16())?;
    if samples > 1 {
        // unspecified extra samples
        directory.write_tag(Tag::ExtraSamples, &vec![0u16; samples - 1][..])?;
    }

    if transform.b == 0.0 && transform.d == 0.0 {
        let scale = [transform.a, -transform.e, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, transform.c, transform.f, 0.0];
        directory.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
        directory.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    } else {
        let t = transform;
        let matrix = [
            t.a, t.b, 0.0, t.c, //
            t.d, t.e, 0.0, t.f, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        directory.write_tag(Tag::ModelTransformationTag, &matrix[..])?;
    }
    // ModelTypeGeographic, RasterPixelIsArea, GeographicType = WGS 84
    let geo_keys: [u16; 16] = [1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 1, 2048, 0, 1, 4326];
    directory.write_tag(Tag::GeoKeyDirectoryTag, &geo_keys[..])?;

    image.write_data(&data)?;

    debug!("Wrote {} band(s) of {}x{} to {:?}", samples, rows, cols, path);
    Ok(())
}
