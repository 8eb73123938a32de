//! Image encoding: file bytes → base64 [`ImageRef`].
//!
//! Rendered pages embed images as data URIs, so supplemental images read
//! from disk are encoded once here. The MIME type is sniffed from the magic
//! bytes; the file extension is only consulted when sniffing fails.

use crate::model::ImageRef;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use std::path::Path;
use tracing::debug;

/// Encode raw image bytes. `hint` supplies an extension fallback for the MIME type.
pub fn encode_image(bytes: &[u8], hint: Option<&Path>) -> ImageRef {
    let mime = sniff_mime(bytes, hint);
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image ({}) → {} bytes base64", mime, b64.len());
    ImageRef::new(mime, b64)
}

/// Read and encode an image file.
pub fn encode_image_file(path: &Path) -> std::io::Result<ImageRef> {
    let bytes = std::fs::read(path)?;
    Ok(encode_image(&bytes, Some(path)))
}

/// MIME type from magic bytes, then extension, then `application/octet-stream`.
pub fn sniff_mime(bytes: &[u8], hint: Option<&Path>) -> &'static str {
    if let Ok(format) = image::guess_format(bytes) {
        return format.to_mime_type();
    }
    hint.and_then(|p| p.extension())
        .and_then(ImageFormat::from_extension)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// Preferred file extension for a sniffed image, used when caching pastes.
pub fn extension_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("bin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("encode png");
        buf
    }

    #[test]
    fn encode_small_png() {
        let bytes = png_bytes();
        let img = encode_image(&bytes, None);
        assert_eq!(img.mime_type, "image/png");
        let decoded = STANDARD.decode(&img.data).expect("valid base64");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn extension_is_fallback() {
        assert_eq!(sniff_mime(b"not an image", Some(Path::new("x.jpg"))), "image/jpeg");
        assert_eq!(sniff_mime(b"not an image", Some(Path::new("x.zzz"))), "application/octet-stream");
        assert_eq!(sniff_mime(b"not an image", None), "application/octet-stream");
    }

    #[test]
    fn extension_for_png() {
        assert_eq!(extension_for(&png_bytes()), "png");
        assert_eq!(extension_for(b"????"), "bin");
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, png_bytes()).unwrap();
        let img = encode_image_file(&path).unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert!(encode_image_file(&dir.path().join("missing.png")).is_err());
    }
}
