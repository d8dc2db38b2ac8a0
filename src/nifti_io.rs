//! NIfTI file I/O
//!
//! Loads 3D and 4D NIfTI-1 images (`.nii` and `.nii.gz`) into [`Image`] and
//! writes float32 NIfTI-1 images, gzip compressed when the path ends with
//! `.nii.gz`.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{AmyPetError, Result};

/// Row-major 4x4 matrix
pub type Affine = [f64; 16];

pub const IDENTITY: Affine = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// Image volume (single frame) or time series of volumes
///
/// Data is stored in Fortran order to match the NIfTI convention:
/// index = x + y*nx + z*nx*ny + t*nx*ny*nz
#[derive(Debug, Clone)]
pub struct Image {
    pub data: Vec<f64>,
    /// Spatial dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Number of frames (1 for a 3D image)
    pub frames: usize,
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Voxel to world (mm) transformation
    pub affine: Affine,
    /// Header description, written on save
    pub description: Option<String>,
}

impl Image {
    /// Create a 3D image, checking the data length against the dimensions
    pub fn new(
        data: Vec<f64>,
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: Affine,
    ) -> Result<Self> {
        let n = dims.0 * dims.1 * dims.2;
        if data.len() != n {
            return Err(AmyPetError::ShapeMismatch(format!(
                "{} values given for a {}x{}x{} volume",
                data.len(), dims.0, dims.1, dims.2
            )));
        }
        Ok(Self { data, dims, frames: 1, voxel_size, affine, description: None })
    }

    /// Stack equally sized frames into a 4D image
    pub fn from_frames(
        frames: Vec<Vec<f64>>,
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: Affine,
    ) -> Result<Self> {
        let n = dims.0 * dims.1 * dims.2;
        if frames.is_empty() {
            return Err(AmyPetError::ShapeMismatch("no frames to stack".into()));
        }
        let nfrm = frames.len();
        let mut data = Vec::with_capacity(n * nfrm);
        for (i, f) in frames.into_iter().enumerate() {
            if f.len() != n {
                return Err(AmyPetError::ShapeMismatch(format!(
                    "frame {} has {} values, expected {}",
                    i, f.len(), n
                )));
            }
            data.extend(f);
        }
        Ok(Self { data, dims, frames: nfrm, voxel_size, affine, description: None })
    }

    /// Same geometry, different single-frame content
    pub fn with_data(&self, data: Vec<f64>) -> Result<Self> {
        let mut img = Image::new(data, self.dims, self.voxel_size, self.affine)?;
        img.description = self.description.clone();
        Ok(img)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Number of voxels in one frame
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn is_dynamic(&self) -> bool {
        self.frames > 1
    }

    /// Borrow the voxels of frame `t`
    pub fn frame(&self, t: usize) -> &[f64] {
        let n = self.n_voxels();
        &self.data[t * n..(t + 1) * n]
    }

    /// Copy frame `t` out as a 3D image
    pub fn frame_image(&self, t: usize) -> Result<Image> {
        if t >= self.frames {
            return Err(AmyPetError::FrameSelection { requested: vec![t], available: self.frames });
        }
        self.with_data(self.frame(t).to_vec())
    }

    /// True if both images share the same spatial dimensions
    pub fn same_shape(&self, other: &Image) -> bool {
        self.dims == other.dims
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().filter(|v| v.is_finite()).fold(f64::MIN, f64::max)
    }

    /// Voxel sizes as an array
    pub fn voxel_array(&self) -> [f64; 3] {
        [self.voxel_size.0, self.voxel_size.1, self.voxel_size.2]
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn decode(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decompressed = Vec::new();
            let info = match std::io::Read::read_to_end(
                &mut GzDecoder::new(Cursor::new(bytes)),
                &mut decompressed,
            ) {
                Ok(_) => get_header_info(&decompressed),
                Err(_) => "Could not decompress".to_string(),
            };
            AmyPetError::Nifti(format!("failed to read gzipped NIfTI: {} ({})", e, info))
        })
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| AmyPetError::Nifti(format!("failed to read NIfTI: {} ({})", e, info)))
    }
}

/// Load a NIfTI image from bytes
///
/// Supports both .nii and .nii.gz (gzip is auto-detected). 3D images yield
/// one frame; 4D images keep all frames.
pub fn load_nifti(bytes: &[u8]) -> Result<Image> {
    let obj = decode(bytes)?;
    let header = obj.header();

    if (header.dim[0] as usize) < 3 {
        return Err(AmyPetError::Nifti(format!(
            "expected at least a 3D volume, got {}D",
            header.dim[0]
        )));
    }

    let voxel_size = (
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    );
    let affine = get_affine(header);
    let description = get_description(&header.descrip);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| AmyPetError::Nifti(format!("failed to convert to ndarray: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(AmyPetError::Nifti(format!("expected at least 3D array, got {}D", shape.len())));
    }

    // nifti-rs may drop trailing singleton dims; rely on the array shape
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    if shape.len() == 3 {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(array[[i, j, k]]);
                }
            }
        }
    } else if shape.len() == 4 {
        for t in 0..nt {
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        data.push(array[[i, j, k, t]]);
                    }
                }
            }
        }
    } else {
        return Err(AmyPetError::Nifti(format!("{}D images are not supported", shape.len())));
    }

    Ok(Image {
        data,
        dims: (nx, ny, nz),
        frames: nt,
        voxel_size,
        affine,
        description,
    })
}

/// Header `descrip` up to the first NUL, if not blank
fn get_description(descrip: &[u8]) -> Option<String> {
    let end = descrip.iter().position(|&b| b == 0).unwrap_or(descrip.len());
    let text = String::from_utf8_lossy(&descrip[..end]).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> Affine {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

fn dim_i16(value: usize, name: &str) -> Result<i16> {
    i16::try_from(value)
        .map_err(|_| AmyPetError::Nifti(format!("dimension {} = {} exceeds NIfTI-1 limits", name, value)))
}

/// Encode an image as uncompressed NIfTI-1 (float32) bytes
pub fn save_nifti(image: &Image) -> Result<Vec<u8>> {
    let (nx, ny, nz) = image.dims;
    let (vsx, vsy, vsz) = image.voxel_size;
    let nt = image.frames.max(1);

    if image.data.len() != nx * ny * nz * nt {
        return Err(AmyPetError::ShapeMismatch(format!(
            "{} values for {}x{}x{}x{} image",
            image.data.len(), nx, ny, nz, nt
        )));
    }

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [
        ndim,
        dim_i16(nx, "x")?,
        dim_i16(ny, "y")?,
        dim_i16(nz, "z")?,
        dim_i16(nt, "t")?,
        1, 1, 1,
    ];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm + seconds
    header[123] = 2 | 8;

    // descrip[80]
    if let Some(descrip) = &image.description {
        let bytes = descrip.as_bytes();
        let len = bytes.len().min(79);
        header[148..148 + len].copy_from_slice(&bytes[..len]);
    }

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4]
                .copy_from_slice(&(image.affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + image.data.len() * 4);
    buffer.write_all(&header)?;
    buffer.write_all(&[0u8; 4])?;
    for &val in &image.data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }

    Ok(buffer)
}

/// Encode an image as gzipped NIfTI-1 bytes (.nii.gz)
pub fn save_nifti_gz(image: &Image) -> Result<Vec<u8>> {
    let uncompressed = save_nifti(image)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)?;
    Ok(encoder.finish()?)
}

/// Read a NIfTI file from a filesystem path
pub fn read_nifti_file(path: &Path) -> Result<Image> {
    let bytes = std::fs::read(path).map_err(|e| {
        AmyPetError::Nifti(format!("failed to read file '{}': {}", path.display(), e))
    })?;
    load_nifti(&bytes)
}

/// Save an image to file; `.nii.gz` paths are gzip compressed
pub fn save_nifti_to_file(path: &Path, image: &Image) -> Result<()> {
    let bytes = if is_nifti_gz(path) {
        save_nifti_gz(image)?
    } else {
        save_nifti(image)?
    };

    std::fs::write(path, &bytes).map_err(|e| {
        AmyPetError::Nifti(format!("failed to write file '{}': {}", path.display(), e))
    })
}

fn is_nifti_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".nii.gz")
}

/// True for `.nii` and `.nii.gz` paths
pub fn is_nifti_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.ends_with(".nii") || s.ends_with(".nii.gz")
}

/// File name with the `.nii`/`.nii.gz` extension removed
pub fn nifti_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name)
        .to_string()
}
