//! Converting document bytes to the transport encoding used by the OCR
//! service.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// MIME type we send for every document. We don't sniff the input, because
/// extension filtering happens before documents reach us.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Encode raw document bytes as standard Base64.
///
/// This is total over any byte sequence. Malformed PDFs are the service's
/// problem, not ours.
pub fn encode_document(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    // Some sources indicate that the Base64 data should be percent-encoded,
    // but document URLs are accepted unescaped.
    format!("data:{};base64,{}", mime_type, encode_document(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_document() {
        assert_eq!(encode_document(b""), "");
        assert_eq!(encode_document(b"Hello"), "SGVsbG8=");
        // Not valid UTF-8, and certainly not a PDF.
        assert_eq!(encode_document(&[0xff, 0x00, 0xfe]), "/wD+");
    }

    #[test]
    fn test_data_url() {
        assert_eq!(
            data_url(PDF_MIME_TYPE, b"%PDF-1.4"),
            "data:application/pdf;base64,JVBERi0xLjQ="
        );
    }
}
