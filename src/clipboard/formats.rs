//! Clipboard Format Mapping and Conversion
//!
//! Maps local X11 selection targets to RDP clipboard format IDs and converts
//! payloads between the remote encodings and what X11 clients expect
//! (`UTF8_STRING`).

use crate::clipboard::error::{ClipboardError, ClipboardResult};
use crate::clipboard::selection::Atom;
use tracing::{debug, warn};

// =============================================================================
// Windows Clipboard Format IDs
// =============================================================================

/// Standard Windows clipboard format: ANSI text
pub const CF_TEXT: u32 = 1;

/// Standard Windows clipboard format: Unicode text (UTF-16LE)
pub const CF_UNICODETEXT: u32 = 13;

/// Formats the bridge announces to the remote side, in priority order
pub const ANNOUNCED_FORMATS: [u32; 2] = [CF_UNICODETEXT, CF_TEXT];

/// Default upper bound for a single clipboard payload (16MB)
pub const DEFAULT_MAX_DATA_SIZE: usize = 16 * 1024 * 1024;

/// Human-readable name for logging
pub fn format_name(format_id: u32) -> &'static str {
    match format_id {
        CF_TEXT => "CF_TEXT",
        CF_UNICODETEXT => "CF_UNICODETEXT",
        2 => "CF_BITMAP",
        8 => "CF_DIB",
        15 => "CF_HDROP",
        16 => "CF_LOCALE",
        17 => "CF_DIBV5",
        0xC000..=0xFFFF => "registered",
        _ => "unknown",
    }
}

// =============================================================================
// Format Mapping
// =============================================================================

/// Correspondence between a local selection target and a remote format ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatMapping {
    /// X11 target atom (e.g. `UTF8_STRING`)
    pub local_target: Atom,
    /// RDP clipboard format ID
    pub remote_format_id: u32,
}

impl FormatMapping {
    /// Create a new mapping
    pub fn new(local_target: Atom, remote_format_id: u32) -> Self {
        Self {
            local_target,
            remote_format_id,
        }
    }
}

/// Built-in mapping table. Order is match priority: Unicode text wins over ANSI.
pub fn builtin_mappings(utf8_target: Atom) -> Vec<FormatMapping> {
    vec![
        FormatMapping::new(utf8_target, CF_UNICODETEXT),
        FormatMapping::new(utf8_target, CF_TEXT),
    ]
}

// =============================================================================
// Format Converter
// =============================================================================

/// Converts clipboard payloads between remote formats and local UTF-8
#[derive(Debug, Clone)]
pub struct FormatConverter {
    /// Maximum input size accepted for a conversion
    pub max_size: usize,
}

impl Default for FormatConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatConverter {
    /// Create a new format converter with default settings
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_DATA_SIZE,
        }
    }

    /// Create a format converter with custom max size
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    fn check_size(&self, len: usize) -> ClipboardResult<()> {
        if len > self.max_size {
            return Err(ClipboardError::DataSizeExceeded {
                actual: len,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Convert remote payload bytes into the local representation.
    ///
    /// Unknown formats are an explicit failure so the caller refuses the
    /// local request instead of delivering an empty property.
    pub fn remote_to_local(&self, format_id: u32, data: &[u8]) -> ClipboardResult<Vec<u8>> {
        match format_id {
            CF_TEXT => self.plain_text(data),
            CF_UNICODETEXT => self.unicode_to_utf8(data),
            other => Err(ClipboardError::UnsupportedFormat(other)),
        }
    }

    /// Convert local UTF-8 text into a remote format payload
    pub fn local_to_remote(&self, format_id: u32, utf8: &[u8]) -> ClipboardResult<Vec<u8>> {
        match format_id {
            CF_TEXT => self.utf8_to_text(utf8),
            CF_UNICODETEXT => self.utf8_to_unicode(utf8),
            other => Err(ClipboardError::UnsupportedFormat(other)),
        }
    }

    /// CF_TEXT is delivered byte for byte
    pub fn plain_text(&self, data: &[u8]) -> ClipboardResult<Vec<u8>> {
        self.check_size(data.len())?;
        Ok(data.to_vec())
    }

    /// Convert UTF-16LE (CF_UNICODETEXT) to UTF-8.
    ///
    /// The output is bounded at twice the input byte length. Conversion stops
    /// at the first NUL code unit; a trailing odd byte is ignored; unpaired
    /// surrogates fail with [`ClipboardError::InvalidUtf16`].
    pub fn unicode_to_utf8(&self, data: &[u8]) -> ClipboardResult<Vec<u8>> {
        self.check_size(data.len())?;

        if data.len() % 2 != 0 {
            debug!("Ignoring trailing odd byte in {}-byte UTF-16 payload", data.len());
        }

        let bound = data.len() * 2;
        let units = data
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .take_while(|&unit| unit != 0);

        let mut out = Vec::with_capacity(bound);
        let mut buf = [0u8; 4];
        for ch in char::decode_utf16(units) {
            let ch = ch.map_err(|_| ClipboardError::InvalidUtf16)?;
            let encoded = ch.encode_utf8(&mut buf);
            if out.len() + encoded.len() > bound {
                warn!(
                    "UTF-16 conversion output exceeds {} bytes, truncating at {} bytes",
                    bound,
                    out.len()
                );
                break;
            }
            out.extend_from_slice(encoded.as_bytes());
        }

        Ok(out)
    }

    /// Convert UTF-8 text to UTF-16LE with the 2-byte terminator Windows expects
    pub fn utf8_to_unicode(&self, utf8: &[u8]) -> ClipboardResult<Vec<u8>> {
        self.check_size(utf8.len())?;
        let text = std::str::from_utf8(utf8).map_err(|_| ClipboardError::InvalidUtf8)?;

        let mut result: Vec<u8> = text.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        result.extend_from_slice(&[0, 0]);
        Ok(result)
    }

    /// Mirror of [`plain_text`](Self::plain_text): bytes pass through, NUL terminated
    pub fn utf8_to_text(&self, utf8: &[u8]) -> ClipboardResult<Vec<u8>> {
        self.check_size(utf8.len())?;
        let mut result = Vec::with_capacity(utf8.len() + 1);
        result.extend_from_slice(utf8);
        result.push(0);
        Ok(result)
    }
}
