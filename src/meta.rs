use std::collections::BTreeMap;
use std::io::Cursor;

use exif::{In, Tag, Value};
use image::DynamicImage;
use tracing::debug;

use crate::error::Result;

/// Undefined/binary EXIF payloads are truncated to this many bytes before
/// being hex encoded.
const MAX_BINARY_BYTES: usize = 40;

/// Decode image bytes and apply the EXIF orientation, if any.
///
/// Orientation handling is best-effort; without metadata the pixels are
/// returned as stored.
pub fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage> {
    let img = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    let orientation = read_orientation(bytes).unwrap_or(1);
    Ok(apply_orientation(img, orientation))
}

fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        // transpose: rotate90 + flip_horizontal
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        // transverse: rotate270 + flip_horizontal
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn read_orientation(bytes: &[u8]) -> Option<u16> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let field = exif.get_field(Tag::Orientation, In::PRIMARY)?;
    let o = field.value.get_uint(0)? as u16;
    debug!(orientation = o, "exif orientation");
    Some(o)
}

/// Flatten the embedded EXIF into a string map.
///
/// Anything unreadable yields an empty map; metadata never blocks an upload.
pub fn extract_metadata(bytes: &[u8]) -> BTreeMap<String, String> {
    let Ok(exif) = exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) else {
        return BTreeMap::new();
    };
    let mut out = BTreeMap::new();
    // primary IFD first so thumbnail fields never shadow it
    let mut fields: Vec<_> = exif.fields().collect();
    fields.sort_by_key(|f| f.ifd_num != In::PRIMARY);
    for field in fields {
        let key = field.tag.to_string();
        if out.contains_key(&key) {
            continue;
        }
        let value = match &field.value {
            Value::Undefined(raw, _) | Value::Byte(raw) => {
                hex(&raw[..raw.len().min(MAX_BINARY_BYTES)])
            }
            _ => field.display_value().to_string(),
        };
        out.insert(key, value);
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
