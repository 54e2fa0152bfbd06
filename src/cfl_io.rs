// Reading and writing of BART style cfl images. An image is a pair of files sharing a base name:
// a text header (.hdr) listing the dimensions, and a raw payload (.cfl) of little-endian complex
// float32 values in column-major order.

use crate::error::{FwdtiError, Result};
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{Array3, Array4, ArrayBase, Data, Dimension, ShapeBuilder};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(".");
    p.push(ext);
    PathBuf::from(p)
}

fn hdr_path(base: &Path) -> PathBuf {
    with_suffix(base, "hdr")
}

fn cfl_path(base: &Path) -> PathBuf {
    with_suffix(base, "cfl")
}

/// strips a trailing .cfl or .hdr extension so either file of the pair can be used as the base
fn base_name(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some("cfl") | Some("hdr") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

/// dimensions listed in a cfl header
pub fn read_header(base: impl AsRef<Path>) -> Result<Vec<usize>> {
    let hdr = hdr_path(&base_name(base.as_ref()));
    let mut s = String::new();
    File::open(&hdr)
        .and_then(|mut f| f.read_to_string(&mut s))
        .map_err(|e| FwdtiError::io(&hdr, e))?;

    let line = s
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| FwdtiError::Format {
            path: hdr.clone(),
            reason: "header has no dimension line".to_string(),
        })?;

    let dims = line
        .split_ascii_whitespace()
        .map(|d| d.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FwdtiError::Format {
            path: hdr.clone(),
            reason: format!("invalid dimension: {}", e),
        })?;
    if dims.is_empty() {
        return Err(FwdtiError::Format {
            path: hdr,
            reason: "header has no dimensions".to_string(),
        });
    }
    Ok(dims)
}

/// Reads a cfl image, returning its dimensions and the magnitude of every element in column-major
/// order
pub fn read_cfl(base: impl AsRef<Path>) -> Result<(Vec<usize>, Vec<f32>)> {
    let base = base_name(base.as_ref());
    let dims = read_header(&base)?;
    let cfl = cfl_path(&base);
    let format_err = |reason: String| FwdtiError::Format { path: cfl.clone(), reason };

    let n = dims
        .iter()
        .try_fold(1usize, |n, &d| n.checked_mul(d))
        .ok_or_else(|| format_err(format!("dims {:?} are too large", dims)))?;
    let expected_bytes = n
        .checked_mul(2 * size_of::<f32>())
        .ok_or_else(|| format_err(format!("dims {:?} are too large", dims)))?;

    // the payload size is checked before anything is allocated
    let found_bytes = fs::metadata(&cfl).map_err(|e| FwdtiError::io(&cfl, e))?.len();
    if found_bytes != expected_bytes as u64 {
        return Err(format_err(format!(
            "expected {} bytes for dims {:?}, found {}",
            expected_bytes, dims, found_bytes
        )));
    }

    let mut byte_buffer = Vec::<u8>::with_capacity(expected_bytes);
    File::open(&cfl)
        .and_then(|mut f| f.read_to_end(&mut byte_buffer))
        .map_err(|e| FwdtiError::io(&cfl, e))?;
    if byte_buffer.len() != expected_bytes {
        return Err(format_err(format!(
            "expected {} bytes for dims {:?}, read {}",
            expected_bytes,
            dims,
            byte_buffer.len()
        )));
    }

    let mut complex_values = vec![0f32; 2 * n];
    LittleEndian::read_f32_into(&byte_buffer, &mut complex_values);
    let magnitudes = complex_values
        .chunks_exact(2)
        .map(|c| c[0].hypot(c[1]))
        .collect();
    Ok((dims, magnitudes))
}

/// leading `n` dimensions, padded with 1. Fails if any dimension past `n` is not a singleton
fn leading_dims<const N: usize>(path: &Path, dims: &[usize]) -> Result<[usize; N]> {
    if dims.iter().skip(N).any(|&d| d != 1) {
        return Err(FwdtiError::Format {
            path: path.to_path_buf(),
            reason: format!("expected at most {} non-singleton dimensions, found {:?}", N, dims),
        });
    }
    let mut out = [1usize; N];
    out.iter_mut().zip(dims).for_each(|(o, &d)| *o = d);
    Ok(out)
}

/// reads a cfl image as a real valued 3-D volume
pub fn read_array3(base: impl AsRef<Path>) -> Result<Array3<f32>> {
    let base = base.as_ref();
    let (dims, values) = read_cfl(base)?;
    let [nx, ny, nz] = leading_dims::<3>(base, &dims)?;
    Array3::from_shape_vec((nx, ny, nz).f(), values).map_err(|e| FwdtiError::Shape(e.to_string()))
}

/// reads a cfl image as a real valued 4-D series (nx, ny, nz, nq)
pub fn read_array4(base: impl AsRef<Path>) -> Result<Array4<f32>> {
    let base = base.as_ref();
    let (dims, values) = read_cfl(base)?;
    let [nx, ny, nz, nq] = leading_dims::<4>(base, &dims)?;
    Array4::from_shape_vec((nx, ny, nz, nq).f(), values).map_err(|e| FwdtiError::Shape(e.to_string()))
}

/// Loads one 3-D volume per file matching `pattern` (sorted by path) and stacks them along the
/// fourth dimension. Every volume must have the same dimensions.
pub fn read_volume_series(pattern: &str) -> Result<Array4<f32>> {
    let paths = glob::glob(pattern).map_err(|e| FwdtiError::config(format!("invalid glob pattern {}: {}", pattern, e)))?;
    let mut paths = paths
        .map(|p| p.map_err(|e| FwdtiError::io(e.path().to_path_buf(), std::io::Error::from(e))))
        .collect::<Result<Vec<_>>>()?;
    // both files of a pair may match the pattern
    paths.iter_mut().for_each(|p| *p = base_name(p));
    paths.sort();
    paths.dedup();
    if paths.is_empty() {
        return Err(FwdtiError::config(format!("no volumes match {}", pattern)));
    }

    let mut vol_dims = None;
    let mut values = vec![];
    for p in &paths {
        let vol = read_array3(p)?;
        let d: [usize; 3] = vol.dim().into();
        let expected = *vol_dims.get_or_insert(d);
        if expected != d {
            return Err(FwdtiError::Shape(format!(
                "volume {} has dims {:?}, expected {:?}",
                p.display(),
                d,
                expected
            )));
        }
        values.extend(vol.t().iter());
    }
    let [nx, ny, nz] = vol_dims.unwrap_or_default();
    Array4::from_shape_vec((nx, ny, nz, paths.len()).f(), values).map_err(|e| FwdtiError::Shape(e.to_string()))
}

/// Writes a real valued array as a cfl image (imaginary parts are zero)
pub fn write_cfl<S, D>(base: impl AsRef<Path>, a: &ArrayBase<S, D>) -> Result<()>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let base = base_name(base.as_ref());

    let hdr = hdr_path(&base);
    let dims = a.shape().iter().map(|d| d.to_string()).collect::<Vec<_>>().join(" ");
    File::create(&hdr)
        .and_then(|mut f| f.write_all(format!("# Dimensions\n{}\n", dims).as_bytes()))
        .map_err(|e| FwdtiError::io(&hdr, e))?;

    // column-major traversal of `a`
    let complex_values = a.t().iter().flat_map(|&x| [x, 0.]).collect::<Vec<f32>>();
    let mut byte_buffer = vec![0u8; complex_values.len() * size_of::<f32>()];
    LittleEndian::write_f32_into(&complex_values, &mut byte_buffer);

    let cfl = cfl_path(&base);
    File::create(&cfl)
        .and_then(|mut f| f.write_all(&byte_buffer))
        .map_err(|e| FwdtiError::io(&cfl, e))
}
