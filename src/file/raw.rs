//! Images assembled from explicit sections.

use super::{Image, Section};

#[derive(Debug, Clone)]
struct RawSection {
    name: String,
    virtual_address: u64,
    virtual_size: u64,
    file_offset: u64,
    data: Vec<u8>,
    executable: bool,
}

/// An [`Image`] built from explicitly provided sections.
///
/// Used for flat code dumps (e.g. a memory dump of a single section) and for building
/// synthetic images in tests.
///
/// # Examples
///
/// ```rust
/// use vmscope::file::{Image, RawImage};
///
/// let image = RawImage::new(64)
///     .with_section(".text", 0x1000, vec![0x90, 0xC3])
///     .with_data_section(".data", 0x2000, vec![0x00; 16]);
///
/// assert_eq!(image.sections().len(), 2);
/// assert_eq!(image.section_containing(0x1001)?.name, ".text");
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct RawImage {
    sections: Vec<RawSection>,
    bitness: u32,
}

impl RawImage {
    /// Creates an image without sections.
    ///
    /// # Arguments
    ///
    /// * `bitness` - 32 for x86, 64 for x64
    #[must_use]
    pub fn new(bitness: u32) -> Self {
        RawImage {
            sections: Vec::new(),
            bitness,
        }
    }

    /// Creates an image with a single executable `.text` section at `base`.
    #[must_use]
    pub fn from_flat(data: Vec<u8>, base: u64, bitness: u32) -> Self {
        Self::new(bitness).with_section(".text", base, data)
    }

    /// Appends an executable section whose virtual size equals its data length.
    #[must_use]
    pub fn with_section(self, name: &str, virtual_address: u64, data: Vec<u8>) -> Self {
        self.push(name, virtual_address, data, true)
    }

    /// Appends a non-executable section whose virtual size equals its data length.
    #[must_use]
    pub fn with_data_section(self, name: &str, virtual_address: u64, data: Vec<u8>) -> Self {
        self.push(name, virtual_address, data, false)
    }

    fn push(mut self, name: &str, virtual_address: u64, data: Vec<u8>, executable: bool) -> Self {
        let file_offset = self
            .sections
            .last()
            .map_or(0, |last| last.file_offset + last.data.len() as u64);

        self.sections.push(RawSection {
            name: name.to_string(),
            virtual_address,
            virtual_size: data.len() as u64,
            file_offset,
            data,
            executable,
        });
        self
    }
}

impl Image for RawImage {
    fn section_count(&self) -> usize {
        self.sections.len()
    }

    fn section(&self, index: usize) -> Option<Section<'_>> {
        let section = self.sections.get(index)?;
        Some(Section {
            name: section.name.as_str(),
            virtual_address: section.virtual_address,
            virtual_size: section.virtual_size,
            file_offset: section.file_offset,
            data: section.data.as_slice(),
            executable: section.executable,
        })
    }

    fn bitness(&self) -> u32 {
        self.bitness
    }
}
