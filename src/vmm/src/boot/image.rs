// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! ARM64 kernel `Image` header parsing.
//!
//! The 64-byte little-endian header (Documentation/arm64/booting.rst):
//!
//! ```text
//! u32 code0;          // executable code
//! u32 code1;
//! u64 text_offset;    // image load offset from the base of RAM
//! u64 image_size;     // effective image size
//! u64 flags;          // bit 0: endianness, bits 1-2: page size,
//!                     // bit 3: placement independent
//! u64 res2, res3, res4;
//! u32 magic;          // "ARM\x64"
//! u32 res5;
//! ```

use std::fs;
use std::path::Path;

use super::BootError;

pub const ARM64_IMAGE_MAGIC: u32 = 0x644d_5241;

const HEADER_SIZE: usize = 64;
/// Load offset assumed for old images that report `text_offset == 0`
/// without signalling placement independence.
const DEFAULT_TEXT_OFFSET: u64 = 0x80000;
/// Flags bit 3: the image may be placed anywhere in RAM.
const FLAG_ANY_PLACEMENT: u64 = 1 << 3;

fn le32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn le64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

/// A parsed ARM64 kernel image, header fields resolved.
pub struct KernelImage {
    pub data: Vec<u8>,
    /// Load offset from the base of RAM, after defaulting rules.
    pub text_offset: u64,
    /// Effective image size; the file length when the header says 0.
    pub image_size: u64,
    pub flags: u64,
}

impl KernelImage {
    pub fn load(path: &Path) -> Result<KernelImage, BootError> {
        let data = fs::read(path).map_err(|e| BootError::Io(path.to_path_buf(), e))?;
        KernelImage::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<KernelImage, BootError> {
        if data.len() < HEADER_SIZE {
            return Err(BootError::TruncatedHeader(data.len()));
        }
        let magic = le32(&data, 56);
        if magic != ARM64_IMAGE_MAGIC {
            return Err(BootError::BadMagic(magic));
        }

        let mut text_offset = le64(&data, 8);
        let mut image_size = le64(&data, 16);
        let flags = le64(&data, 24);

        if text_offset == 0 && flags & FLAG_ANY_PLACEMENT == 0 {
            // Old image convention: a zero offset without the
            // placement-independent flag means the 512 KiB default.
            text_offset = DEFAULT_TEXT_OFFSET;
        }
        if image_size == 0 {
            image_size = data.len() as u64;
        }

        Ok(KernelImage {
            data,
            text_offset,
            image_size,
            flags,
        })
    }

    pub fn is_little_endian(&self) -> bool {
        self.flags & 1 == 0
    }

    /// Page size the kernel was built for, when the header says.
    pub fn page_size(&self) -> Option<u64> {
        match (self.flags >> 1) & 0x3 {
            1 => Some(4 << 10),
            2 => Some(16 << 10),
            3 => Some(64 << 10),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(text_offset: u64, image_size: u64, flags: u64, magic: u32) -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[8..16].copy_from_slice(&text_offset.to_le_bytes());
        data[16..24].copy_from_slice(&image_size.to_le_bytes());
        data[24..32].copy_from_slice(&flags.to_le_bytes());
        data[56..60].copy_from_slice(&magic.to_le_bytes());
        data
    }

    #[test]
    fn test_parse_returns_header_fields() {
        let image =
            KernelImage::parse(header(0x80000, 0x120_0000, 0xa, ARM64_IMAGE_MAGIC)).unwrap();
        assert_eq!(image.text_offset, 0x80000);
        assert_eq!(image.image_size, 0x120_0000);
        assert_eq!(image.flags, 0xa);
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(matches!(
            KernelImage::parse(header(0, 0, 0, 0xdead_beef)),
            Err(BootError::BadMagic(0xdead_beef))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(matches!(
            KernelImage::parse(vec![0u8; 63]),
            Err(BootError::TruncatedHeader(63))
        ));
    }

    #[test]
    fn test_zero_text_offset_defaults_without_flag() {
        let image = KernelImage::parse(header(0, 1, 0, ARM64_IMAGE_MAGIC)).unwrap();
        assert_eq!(image.text_offset, 0x80000);
    }

    #[test]
    fn test_zero_text_offset_kept_with_placement_flag() {
        let image = KernelImage::parse(header(0, 1, 1 << 3, ARM64_IMAGE_MAGIC)).unwrap();
        assert_eq!(image.text_offset, 0);
    }

    #[test]
    fn test_nonzero_text_offset_never_defaulted() {
        let image = KernelImage::parse(header(0x20000, 1, 0, ARM64_IMAGE_MAGIC)).unwrap();
        assert_eq!(image.text_offset, 0x20000);
    }

    #[test]
    fn test_zero_image_size_uses_file_length() {
        let mut data = header(0x80000, 0, 0, ARM64_IMAGE_MAGIC);
        data.resize(100, 0);
        let image = KernelImage::parse(data).unwrap();
        assert_eq!(image.image_size, 100);
    }

    #[test]
    fn test_page_size_field() {
        let cases = [(0u64, None), (1, Some(4096)), (2, Some(16384)), (3, Some(65536))];
        for (bits, expected) in cases {
            let image =
                KernelImage::parse(header(0x80000, 1, bits << 1, ARM64_IMAGE_MAGIC)).unwrap();
            assert_eq!(image.page_size(), expected);
        }
    }

    #[test]
    fn test_endianness_flag() {
        let image = KernelImage::parse(header(0x80000, 1, 0, ARM64_IMAGE_MAGIC)).unwrap();
        assert!(image.is_little_endian());
        let image = KernelImage::parse(header(0x80000, 1, 1, ARM64_IMAGE_MAGIC)).unwrap();
        assert!(!image.is_little_endian());
    }
}
