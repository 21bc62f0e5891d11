use exif::{Exif, Field, In, Reader, Tag, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifMetadata {
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens: Option<String>,
    pub datetime_original: Option<i64>,
    pub gps_lat: Option<f64>,
    pub gps_lng: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

fn parse_datetime(value: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(value, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|dt| chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc).timestamp())
}

fn read_container<R: BufRead + Seek>(reader: &mut R) -> Option<Exif> {
    match Reader::new().read_from_container(reader) {
        Ok(exif) => Some(exif),
        Err(exif::Error::NotFound(_))
        | Err(exif::Error::NotSupported(_))
        | Err(exif::Error::BlankValue(_)) => None,
        Err(err) => {
            log::debug!("EXIF parse failed: {err}");
            None
        }
    }
}

/// Reads embedded metadata from a file on disk. Missing or unparsable EXIF is `None`.
pub fn read_metadata(path: &Path) -> Option<ExifMetadata> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    read_container(&mut reader).map(|exif| from_exif(&exif))
}

pub fn read_metadata_from_bytes(bytes: &[u8]) -> Option<ExifMetadata> {
    let mut cursor = Cursor::new(bytes);
    read_container(&mut cursor).map(|exif| from_exif(&exif))
}

/// Capture date from embedded metadata only.
pub fn capture_date(path: &Path) -> Option<i64> {
    read_metadata(path).and_then(|meta| meta.datetime_original)
}

/// JPEG preview carried in the thumbnail IFD, if any. RAW containers that
/// `image` cannot decode usually have one.
pub fn embedded_preview(bytes: &[u8]) -> Option<Vec<u8>> {
    let exif = read_container(&mut Cursor::new(bytes))?;
    let offset = exif
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let len = exif
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let buf = exif.buf();
    let end = offset.checked_add(len)?;
    if len == 0 || end > buf.len() {
        return None;
    }
    Some(buf[offset..end].to_vec())
}

fn from_exif(exif: &Exif) -> ExifMetadata {
    let make = get_string(exif, Tag::Make);
    let model = normalize_model(&make, get_string(exif, Tag::Model));
    ExifMetadata {
        make,
        model,
        lens: get_string(exif, Tag::LensModel).or_else(|| get_string(exif, Tag::LensMake)),
        datetime_original: get_string(exif, Tag::DateTimeOriginal)
            .or_else(|| get_string(exif, Tag::DateTimeDigitized))
            .or_else(|| get_string(exif, Tag::DateTime))
            .and_then(|s| parse_datetime(&s)),
        gps_lat: get_coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S"),
        gps_lng: get_coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W"),
        width: get_uint(exif, Tag::PixelXDimension).or_else(|| get_uint(exif, Tag::ImageWidth)),
        height: get_uint(exif, Tag::PixelYDimension).or_else(|| get_uint(exif, Tag::ImageLength)),
    }
}

fn field(exif: &Exif, tag: Tag) -> Option<&Field> {
    exif.get_field(tag, In::PRIMARY)
}

fn get_string(exif: &Exif, tag: Tag) -> Option<String> {
    match &field(exif, tag)?.value {
        Value::Ascii(values) => values.first().and_then(|raw| {
            let text = String::from_utf8_lossy(raw);
            let text = text.trim_matches(char::from(0)).trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        }),
        _ => None,
    }
}

fn get_uint(exif: &Exif, tag: Tag) -> Option<u32> {
    field(exif, tag)?.value.get_uint(0)
}

fn get_coordinate(exif: &Exif, tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let Value::Rational(parts) = &field(exif, tag)?.value else {
        return None;
    };
    if parts.len() < 3 {
        return None;
    }
    let degrees = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;
    if !degrees.is_finite() {
        return None;
    }
    let negative = get_string(exif, ref_tag)
        .map(|r| r.eq_ignore_ascii_case(negative_ref))
        .unwrap_or(false);
    Some(if negative { -degrees } else { degrees })
}

fn normalize_model(make: &Option<String>, model: Option<String>) -> Option<String> {
    let model = model?;
    let model_trim = model.trim();
    if model_trim.is_empty() {
        return None;
    }
    let Some(make) = make.as_ref() else {
        return Some(model_trim.to_string());
    };
    let make_trim = make.trim();
    if make_trim.is_empty() {
        return Some(model_trim.to_string());
    }

    // "Canon" + "Canon EOS R5" reads better as just the model.
    let make_lc = make_trim.to_ascii_lowercase();
    let model_lc = model_trim.to_ascii_lowercase();
    if model_lc.starts_with(&make_lc) {
        let rest = &model_trim[make_trim.len()..];
        let separated = rest.starts_with(|c: char| c.is_whitespace() || c == '-' || c == '_');
        let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '-' || c == '_');
        if separated && !rest.is_empty() {
            return Some(rest.to_string());
        }
    }
    Some(model_trim.to_string())
}
