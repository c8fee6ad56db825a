//! Minimal MAT-file (Level 5) container codec.
//!
//! Only what the legacy approval file needs: enumerate top-level variables,
//! read numeric scalars, and replace or add one `uint8` scalar while keeping
//! every other variable byte for byte.
//!
//! Two readers exist. The strict reader validates the 128-byte header; the
//! lenient reader ignores it, sniffs the byte order and keeps whatever
//! variables parse before the first damaged element. HDF5-based (v7.3)
//! files are recognised by [`is_hdf5`] and left to the `mat73` module.

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use flate2::read::ZlibDecoder;
use warpdrive_core::error::{Result, WarpDriveError};

pub(crate) const HEADER_LEN: usize = 128;
pub(crate) const HEADER_TEXT_LEN: usize = 116;
const VERSION: u16 = 0x0100;
const HDF5_SIGNATURE: &[u8] = b"\x89HDF\r\n\x1a\n";
/// v7.3 files carry a 512-byte user block before the HDF5 superblock.
pub(crate) const HDF5_OFFSET: usize = 512;

/// Whether `bytes` start an HDF5-based (v7.3) MAT-file.
pub fn is_hdf5(bytes: &[u8]) -> bool {
    bytes.len() > HDF5_OFFSET && bytes[HDF5_OFFSET..].starts_with(HDF5_SIGNATURE)
}

/// Whether the file at `path` is an HDF5-based (v7.3) MAT-file.
pub fn is_hdf5_file<P: AsRef<Path>>(path: P) -> Result<bool> {
    let mut head = Vec::with_capacity(HDF5_OFFSET + HDF5_SIGNATURE.len());
    std::fs::File::open(path.as_ref())?
        .take((HDF5_OFFSET + HDF5_SIGNATURE.len()) as u64)
        .read_to_end(&mut head)?;
    Ok(is_hdf5(&head))
}

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

const MX_UINT8_CLASS: u32 = 9;

/// Byte order of a MAT-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Decode the two indicator bytes at the end of the header.
    fn from_indicator(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"IM" => Some(Endian::Little),
            b"MI" => Some(Endian::Big),
            _ => None,
        }
    }

    fn u16(self, b: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        }
    }

    fn u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    fn u64(self, b: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        }
    }

    fn put_u16(self, out: &mut Vec<u8>, v: u16) {
        // Writing into a Vec cannot fail
        let _ = match self {
            Endian::Little => out.write_u16::<LittleEndian>(v),
            Endian::Big => out.write_u16::<BigEndian>(v),
        };
    }

    fn put_u32(self, out: &mut Vec<u8>, v: u32) {
        let _ = match self {
            Endian::Little => out.write_u32::<LittleEndian>(v),
            Endian::Big => out.write_u32::<BigEndian>(v),
        };
    }
}

/// One top-level variable.
#[derive(Debug, Clone, PartialEq)]
pub struct MatVariable {
    name: String,
    value: Option<f64>,
    raw: Vec<u8>,
}

impl MatVariable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First element of a numeric array, if any.
    pub fn scalar(&self) -> Option<f64> {
        self.value
    }
}

/// A parsed MAT-file.
#[derive(Debug, Clone, PartialEq)]
pub struct MatFile {
    header_text: Vec<u8>,
    endian: Endian,
    variables: Vec<MatVariable>,
}

impl MatFile {
    /// Empty little-endian file.
    pub fn new() -> Self {
        let mut header_text = b"MATLAB 5.0 MAT-file, written by warpdrive".to_vec();
        header_text.resize(HEADER_TEXT_LEN, b' ');
        Self {
            header_text,
            endian: Endian::Little,
            variables: Vec::new(),
        }
    }

    /// Parse with the strict reader, falling back to the lenient one.
    ///
    /// # Errors
    /// `InconsistentState` if neither reader understands the bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if is_hdf5(bytes) {
            return Err(WarpDriveError::inconsistent_state(
                "HDF5-based MAT-file (v7.3) passed to the Level 5 reader",
            ));
        }
        match parse_strict(bytes) {
            Ok(file) => Ok(file),
            Err(strict) => {
                tracing::debug!(error = %strict, "strict MAT-file reader failed, trying lenient reader");
                parse_lenient(bytes).map_err(|lenient| {
                    WarpDriveError::inconsistent_state(format!(
                        "unreadable MAT-file ({strict}; {lenient})"
                    ))
                })
            }
        }
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::parse(&bytes)
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn variables(&self) -> &[MatVariable] {
        &self.variables
    }

    pub fn get(&self, name: &str) -> Option<&MatVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Replace `name` with a 1x1 `uint8` array, or append it.
    pub fn set_uint8_scalar(&mut self, name: &str, value: u8) {
        let variable = MatVariable {
            name: name.to_string(),
            value: Some(value as f64),
            raw: encode_uint8_scalar(self.endian, name, value),
        };
        match self.variables.iter_mut().find(|v| v.name == name) {
            Some(existing) => *existing = variable,
            None => self.variables.push(variable),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&self.header_text);
        out.resize(HEADER_TEXT_LEN, b' ');
        out.extend_from_slice(&[0u8; 8]);
        self.endian.put_u16(&mut out, VERSION);
        out.extend_from_slice(match self.endian {
            Endian::Little => b"IM",
            Endian::Big => b"MI",
        });
        for variable in &self.variables {
            out.extend_from_slice(&variable.raw);
        }
        out
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path.as_ref())?;
        file.write_all(&self.to_bytes())?;
        Ok(())
    }
}

impl Default for MatFile {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_strict(bytes: &[u8]) -> Result<MatFile> {
    if bytes.len() < HEADER_LEN {
        return Err(WarpDriveError::inconsistent_state("file shorter than MAT header"));
    }
    if !bytes.starts_with(b"MATLAB 5.0 MAT-file") {
        return Err(WarpDriveError::inconsistent_state("missing Level 5 header text"));
    }
    let endian = Endian::from_indicator(&bytes[126..128])
        .ok_or_else(|| WarpDriveError::inconsistent_state("bad endian indicator"))?;
    let version = endian.u16(&bytes[124..126]);
    if version != VERSION {
        return Err(WarpDriveError::inconsistent_state(format!(
            "unsupported MAT version {version:#06x}"
        )));
    }

    Ok(MatFile {
        header_text: bytes[..HEADER_TEXT_LEN].to_vec(),
        endian,
        variables: parse_elements(endian, &bytes[HEADER_LEN..], true)?,
    })
}

fn parse_lenient(bytes: &[u8]) -> Result<MatFile> {
    if bytes.len() < HEADER_LEN {
        return Err(WarpDriveError::inconsistent_state("file shorter than MAT header"));
    }
    let endian = Endian::from_indicator(&bytes[126..128]).unwrap_or(Endian::Little);
    let body = &bytes[HEADER_LEN..];
    let variables = parse_elements(endian, body, false)?;
    if variables.is_empty() && !body.is_empty() {
        return Err(WarpDriveError::inconsistent_state("no readable variables"));
    }

    let mut file = MatFile::new();
    file.endian = endian;
    file.variables = variables;
    Ok(file)
}

fn parse_elements(endian: Endian, body: &[u8], strict: bool) -> Result<Vec<MatVariable>> {
    let mut variables = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let parsed = element_span(endian, body, pos).and_then(|end| {
            let raw = &body[pos..end];
            decode_variable(endian, raw).map(|(name, value)| MatVariable {
                name,
                value,
                raw: raw.to_vec(),
            })
        });
        match parsed {
            Ok(variable) => {
                pos += variable.raw.len();
                variables.push(variable);
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                tracing::warn!(offset = HEADER_LEN + pos, error = %e, "stopping at unreadable MAT element");
                break;
            }
        }
    }
    Ok(variables)
}

/// End offset of the top-level element starting at `pos`.
fn element_span(endian: Endian, body: &[u8], pos: usize) -> Result<usize> {
    if body.len() - pos < 8 {
        return Err(WarpDriveError::inconsistent_state("truncated element tag"));
    }
    let data_type = endian.u32(&body[pos..]);
    let len = endian.u32(&body[pos + 4..]) as usize;
    let unpadded = pos + 8 + len;
    if unpadded > body.len() {
        return Err(WarpDriveError::inconsistent_state("truncated element data"));
    }
    if data_type == MI_COMPRESSED {
        return Ok(unpadded);
    }
    // Tolerate a missing final pad
    Ok((pos + 8 + pad8(len)).min(body.len()))
}

fn decode_variable(endian: Endian, element: &[u8]) -> Result<(String, Option<f64>)> {
    let (data_type, payload, _) = sub_element(endian, element, 0)?;
    match data_type {
        MI_COMPRESSED => {
            let mut inflated = Vec::new();
            ZlibDecoder::new(payload)
                .read_to_end(&mut inflated)
                .map_err(|e| WarpDriveError::inconsistent_state(format!("bad compressed element: {e}")))?;
            decode_variable(endian, &inflated)
        }
        MI_MATRIX => decode_matrix(endian, payload),
        other => Err(WarpDriveError::inconsistent_state(format!(
            "unexpected top-level element type {other}"
        ))),
    }
}

fn decode_matrix(endian: Endian, data: &[u8]) -> Result<(String, Option<f64>)> {
    let (_, _, pos) = sub_element(endian, data, 0)?; // array flags
    let (_, _, pos) = sub_element(endian, data, pos)?; // dimensions
    let (_, name_bytes, pos) = sub_element(endian, data, pos)?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    let value = if pos < data.len() {
        let (data_type, real, _) = sub_element(endian, data, pos)?;
        first_number(endian, data_type, real)
    } else {
        None
    };
    Ok((name, value))
}

/// `(type, payload, next offset)` of the element at `pos`, handling the
/// small-element format.
fn sub_element(endian: Endian, data: &[u8], pos: usize) -> Result<(u32, &[u8], usize)> {
    if data.len() < pos + 8 {
        return Err(WarpDriveError::inconsistent_state("truncated sub-element"));
    }
    let first = endian.u32(&data[pos..]);
    let small_len = (first >> 16) as usize;
    if small_len != 0 {
        if small_len > 4 {
            return Err(WarpDriveError::inconsistent_state("bad small element"));
        }
        let payload = &data[pos + 4..pos + 4 + small_len];
        return Ok((first & 0xffff, payload, pos + 8));
    }

    let len = endian.u32(&data[pos + 4..]) as usize;
    let start = pos + 8;
    if data.len() < start + len {
        return Err(WarpDriveError::inconsistent_state("truncated sub-element data"));
    }
    Ok((first, &data[start..start + len], start + pad8(len)))
}

fn first_number(endian: Endian, data_type: u32, b: &[u8]) -> Option<f64> {
    let width = match data_type {
        MI_INT8 | MI_UINT8 => 1,
        MI_INT16 | MI_UINT16 => 2,
        MI_INT32 | MI_UINT32 | MI_SINGLE => 4,
        MI_DOUBLE | MI_INT64 | MI_UINT64 => 8,
        _ => return None,
    };
    if b.len() < width {
        return None;
    }
    Some(match data_type {
        MI_INT8 => b[0] as i8 as f64,
        MI_UINT8 => b[0] as f64,
        MI_INT16 => endian.u16(b) as i16 as f64,
        MI_UINT16 => endian.u16(b) as f64,
        MI_INT32 => endian.u32(b) as i32 as f64,
        MI_UINT32 => endian.u32(b) as f64,
        MI_SINGLE => f32::from_bits(endian.u32(b)) as f64,
        MI_DOUBLE => f64::from_bits(endian.u64(b)),
        MI_INT64 => endian.u64(b) as i64 as f64,
        _ => endian.u64(b) as f64,
    })
}

fn encode_uint8_scalar(endian: Endian, name: &str, value: u8) -> Vec<u8> {
    let mut body = Vec::new();

    // Array flags: class only
    endian.put_u32(&mut body, MI_UINT32);
    endian.put_u32(&mut body, 8);
    endian.put_u32(&mut body, MX_UINT8_CLASS);
    endian.put_u32(&mut body, 0);

    // Dimensions 1x1
    endian.put_u32(&mut body, MI_INT32);
    endian.put_u32(&mut body, 8);
    endian.put_u32(&mut body, 1);
    endian.put_u32(&mut body, 1);

    let name = name.as_bytes();
    if name.len() <= 4 {
        endian.put_u32(&mut body, ((name.len() as u32) << 16) | MI_INT8);
        body.extend_from_slice(name);
        body.resize(body.len() + 4 - name.len(), 0);
    } else {
        endian.put_u32(&mut body, MI_INT8);
        endian.put_u32(&mut body, name.len() as u32);
        body.extend_from_slice(name);
        body.resize(body.len() + pad8(name.len()) - name.len(), 0);
    }

    // Real part as a small element
    endian.put_u32(&mut body, (1 << 16) | MI_UINT8);
    body.extend_from_slice(&[value, 0, 0, 0]);

    let mut element = Vec::with_capacity(body.len() + 8);
    endian.put_u32(&mut element, MI_MATRIX);
    endian.put_u32(&mut element, body.len() as u32);
    element.extend_from_slice(&body);
    element
}

fn pad8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    /// A 1x1 double variable as written by MATLAB.
    fn double_scalar(endian: Endian, name: &str, value: f64) -> Vec<u8> {
        let mut raw = encode_uint8_scalar(endian, name, 0);
        // Swap the uint8 small element for a full double element
        raw.truncate(raw.len() - 8);
        match endian {
            Endian::Little => {
                raw.write_u32::<LittleEndian>(MI_DOUBLE).unwrap();
                raw.write_u32::<LittleEndian>(8).unwrap();
                raw.write_f64::<LittleEndian>(value).unwrap();
            }
            Endian::Big => {
                raw.write_u32::<BigEndian>(MI_DOUBLE).unwrap();
                raw.write_u32::<BigEndian>(8).unwrap();
                raw.write_f64::<BigEndian>(value).unwrap();
            }
        }
        let body_len = (raw.len() - 8) as u32;
        match endian {
            Endian::Little => LittleEndian::write_u32(&mut raw[4..8], body_len),
            Endian::Big => BigEndian::write_u32(&mut raw[4..8], body_len),
        }
        raw
    }

    fn file_with(endian: Endian, elements: &[Vec<u8>]) -> Vec<u8> {
        let mut file = MatFile::new();
        file.endian = endian;
        let mut bytes = file.to_bytes();
        for e in elements {
            bytes.extend_from_slice(e);
        }
        bytes
    }

    #[test]
    fn test_write_then_read_scalar() {
        let mut file = MatFile::new();
        file.set_uint8_scalar("glanat", 2);
        let parsed = MatFile::parse(&file.to_bytes()).unwrap();
        assert_eq!(parsed.variables().len(), 1);
        assert_eq!(parsed.get("glanat").unwrap().scalar(), Some(2.0));
    }

    #[test]
    fn test_short_name_uses_small_element() {
        let mut file = MatFile::new();
        file.set_uint8_scalar("ok", 1);
        let parsed = MatFile::parse(&file.to_bytes()).unwrap();
        assert_eq!(parsed.get("ok").unwrap().scalar(), Some(1.0));
    }

    #[test]
    fn test_replace_keeps_other_variables() {
        let bytes = file_with(
            Endian::Little,
            &[
                double_scalar(Endian::Little, "method", 3.5),
                encode_uint8_scalar(Endian::Little, "glanat", 0),
                double_scalar(Endian::Little, "normalize", -1.0),
            ],
        );
        let mut file = MatFile::parse(&bytes).unwrap();
        let method_raw = file.get("method").unwrap().raw.clone();

        file.set_uint8_scalar("glanat", 2);
        let reparsed = MatFile::parse(&file.to_bytes()).unwrap();
        let names: Vec<&str> = reparsed.variables().iter().map(|v| v.name()).collect();
        assert_eq!(names, ["method", "glanat", "normalize"]);
        assert_eq!(reparsed.get("glanat").unwrap().scalar(), Some(2.0));
        assert_eq!(reparsed.get("normalize").unwrap().scalar(), Some(-1.0));
        assert_eq!(reparsed.get("method").unwrap().raw, method_raw);
    }

    #[test]
    fn test_big_endian() {
        let bytes = file_with(Endian::Big, &[double_scalar(Endian::Big, "glanat", 2.0)]);
        let mut file = MatFile::parse(&bytes).unwrap();
        assert_eq!(file.endian(), Endian::Big);
        assert_eq!(file.get("glanat").unwrap().scalar(), Some(2.0));

        file.set_uint8_scalar("approved", 1);
        let reparsed = MatFile::parse(&file.to_bytes()).unwrap();
        assert_eq!(reparsed.get("approved").unwrap().scalar(), Some(1.0));
    }

    #[test]
    fn test_compressed_variable() {
        let inner = double_scalar(Endian::Little, "glanat", 2.0);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&inner).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut element = Vec::new();
        element.write_u32::<LittleEndian>(MI_COMPRESSED).unwrap();
        element.write_u32::<LittleEndian>(compressed.len() as u32).unwrap();
        element.extend_from_slice(&compressed);

        let bytes = file_with(Endian::Little, &[element.clone()]);
        let file = MatFile::parse(&bytes).unwrap();
        assert_eq!(file.get("glanat").unwrap().scalar(), Some(2.0));
        // Rewritten verbatim
        assert!(file.to_bytes().ends_with(&element));
    }

    #[test]
    fn test_lenient_reader_skips_bad_header_and_trailing_garbage() {
        let mut bytes = file_with(
            Endian::Little,
            &[encode_uint8_scalar(Endian::Little, "glanat", 2)],
        );
        bytes[..6].copy_from_slice(b"XXXXXX");
        bytes.extend_from_slice(&[0xff; 5]);

        let file = MatFile::parse(&bytes).unwrap();
        assert_eq!(file.get("glanat").unwrap().scalar(), Some(2.0));
    }

    #[test]
    fn test_hdf5_signature_after_user_block() {
        let mut bytes = vec![0u8; HDF5_OFFSET];
        bytes.extend_from_slice(HDF5_SIGNATURE);
        assert!(is_hdf5(&bytes));
        assert!(!is_hdf5(&bytes[HDF5_OFFSET..]));
        assert!(!is_hdf5(&MatFile::new().to_bytes()));
        assert!(matches!(MatFile::parse(&bytes), Err(WarpDriveError::InconsistentState(_))));
    }

    #[test]
    fn test_garbage_is_inconsistent() {
        let err = MatFile::parse(b"not a mat file").unwrap_err();
        assert!(matches!(err, WarpDriveError::InconsistentState(_)));
    }
}
