//! Executable image abstraction.
//!
//! The devirtualization pipeline never parses file formats itself. It works against the
//! [`Image`] trait, which exposes the section table of a loaded executable and the
//! address translation the scanner and flattener need.
//!
//! # Key Components
//!
//! - [`Image`] - Section lookup and RVA translation used by the whole pipeline
//! - [`Section`] - Borrowed, read-only view of one section
//! - [`PeImage`] - PE32/PE32+ images parsed with goblin (memory-mapped or in-memory)
//! - [`RawImage`] - Images assembled from explicit sections, e.g. flat code dumps
//! - [`Backend`] - Data source abstraction for [`PeImage`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use vmscope::file::{Image, PeImage};
//! use std::path::Path;
//!
//! let image = PeImage::from_file(Path::new("protected.vmp.exe"))?;
//! for section in image.sections() {
//!     println!("{:<8} 0x{:08x} 0x{:x}", section.name, section.virtual_address, section.virtual_size);
//! }
//! let text = image.section_containing(0x1000)?;
//! println!("0x1000 lives in {}", text.name);
//! # Ok::<(), vmscope::Error>(())
//! ```

mod memory;
mod physical;
mod raw;

use std::path::Path;

use goblin::pe::{
    header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64},
    section_table::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE},
    PE,
};

use crate::{Error, Result};
use memory::Memory;
use physical::Physical;

pub use raw::RawImage;

/// Backend trait for file data sources.
///
/// This trait abstracts over the source of image data, allowing for both in-memory and on-disk
/// representations. All implementations must be thread-safe, since one image is shared
/// read-only between all workers analysing its VM entries.
pub trait Backend: Send + Sync {
    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data().get(offset..end))
            .ok_or(Error::OutOfBounds)
    }
}

/// A borrowed, read-only view of one image section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    /// Section name with trailing NUL padding removed (e.g. `.text`)
    pub name: &'a str,
    /// RVA of the first byte of the section
    pub virtual_address: u64,
    /// Size of the section once mapped
    pub virtual_size: u64,
    /// Offset of the raw data within the file
    pub file_offset: u64,
    /// Raw section content
    pub data: &'a [u8],
    /// Whether the section is marked as containing executable code
    pub executable: bool,
}

impl<'a> Section<'a> {
    /// Returns the mapped extent of the section.
    ///
    /// Some linkers leave `virtual_size` at zero; the raw data length is used then.
    #[must_use]
    pub fn extent(&self) -> u64 {
        if self.virtual_size == 0 {
            self.data.len() as u64
        } else {
            self.virtual_size
        }
    }

    /// Returns the first RVA past the end of the section.
    #[must_use]
    pub fn virtual_end(&self) -> u64 {
        self.virtual_address.saturating_add(self.extent())
    }

    /// Returns `true` if `rva` lies within the mapped extent of this section.
    #[must_use]
    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.virtual_address && rva < self.virtual_end()
    }

    /// Returns the byte at `rva`, or `None` when it is outside the raw data.
    #[must_use]
    pub fn byte_at(&self, rva: u64) -> Option<u8> {
        let offset = usize::try_from(rva.checked_sub(self.virtual_address)?).ok()?;
        self.data.get(offset).copied()
    }

    /// Returns up to `max` bytes starting at `rva`, clipped to the end of the raw data.
    ///
    /// The returned slice is empty when `rva` is outside the raw data.
    #[must_use]
    pub fn window(&self, rva: u64, max: usize) -> &'a [u8] {
        let Some(offset) = rva
            .checked_sub(self.virtual_address)
            .and_then(|offset| usize::try_from(offset).ok())
        else {
            return &[];
        };

        if offset >= self.data.len() {
            return &[];
        }

        let end = offset.saturating_add(max).min(self.data.len());
        &self.data[offset..end]
    }
}

/// Section table and address translation of a loaded executable.
///
/// Implemented by [`PeImage`] and [`RawImage`]. Implementations are read-only; analysis of
/// distinct VM entries may share one image across threads when it is `Sync`.
pub trait Image {
    /// Returns the number of sections.
    fn section_count(&self) -> usize;

    /// Returns the section at `index` in table order.
    fn section(&self, index: usize) -> Option<Section<'_>>;

    /// Returns the code bitness (32 or 64) used to decode instructions.
    fn bitness(&self) -> u32 {
        64
    }

    /// Returns all sections in table order.
    fn sections(&self) -> Vec<Section<'_>> {
        (0..self.section_count())
            .filter_map(|index| self.section(index))
            .collect()
    }

    /// Returns the section whose mapped extent contains `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SectionNotFound`] when `rva` maps outside all sections.
    fn section_containing(&self, rva: u64) -> Result<Section<'_>> {
        (0..self.section_count())
            .filter_map(|index| self.section(index))
            .find(|section| section.contains(rva))
            .ok_or(Error::SectionNotFound(rva))
    }

    /// Returns the first section with the given name.
    fn section_by_name(&self, name: &str) -> Option<Section<'_>> {
        (0..self.section_count())
            .filter_map(|index| self.section(index))
            .find(|section| section.name == name)
    }

    /// Converts an RVA to a file offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SectionNotFound`] when `rva` maps outside all sections.
    fn rva_to_offset(&self, rva: u64) -> Result<u64> {
        let section = self.section_containing(rva)?;
        Ok(section.file_offset + (rva - section.virtual_address))
    }
}

/// Owned copy of the fields of a goblin section header the pipeline needs.
#[derive(Debug, Clone)]
struct SectionHeader {
    name: String,
    virtual_address: u64,
    virtual_size: u64,
    raw_offset: usize,
    raw_size: usize,
    executable: bool,
}

/// A PE32 or PE32+ executable.
///
/// The section table is extracted once with goblin while loading; section contents are
/// borrowed directly from the backend afterwards.
///
/// # Examples
///
/// ```rust,no_run
/// use vmscope::file::{Image, PeImage};
///
/// let data = std::fs::read("protected.vmp.exe")?;
/// let image = PeImage::from_mem(data)?;
/// println!("{}-bit image based at 0x{:x}", image.bitness(), image.image_base());
/// # Ok::<(), vmscope::Error>(())
/// ```
pub struct PeImage {
    /// The underlying data source (memory or file).
    data: Box<dyn Backend>,
    /// Section headers in table order
    headers: Vec<SectionHeader>,
    /// Preferred load address
    image_base: u64,
    /// RVA of the entry point
    entry_point: u64,
    /// 32 for PE32, 64 for PE32+
    bitness: u32,
}

impl PeImage {
    /// Loads a PE file from the given path.
    ///
    /// The file is memory-mapped for efficient access.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is empty, is not a valid PE, or
    /// targets a machine other than x86/x64.
    pub fn from_file(file: &Path) -> Result<PeImage> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Loads a PE file from a memory buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is empty, is not a valid PE, or targets a machine
    /// other than x86/x64.
    pub fn from_mem(data: Vec<u8>) -> Result<PeImage> {
        let input = Memory::new(data);

        Self::load(input)
    }

    /// Internal loader for any backend.
    fn load<T: Backend + 'static>(data: T) -> Result<PeImage> {
        if data.len() == 0 {
            return Err(Error::Empty);
        }

        let (headers, image_base, entry_point, bitness) = {
            let pe = PE::parse(data.data())?;

            let bitness = match pe.header.coff_header.machine {
                COFF_MACHINE_X86_64 => 64,
                COFF_MACHINE_X86 => 32,
                _ => return Err(Error::NotSupported),
            };

            let mut headers = Vec::with_capacity(pe.sections.len());
            for section in &pe.sections {
                let name = match &section.real_name {
                    Some(real_name) => real_name.clone(),
                    None => String::from_utf8_lossy(&section.name)
                        .trim_end_matches('\0')
                        .to_string(),
                };

                let raw_offset = section.pointer_to_raw_data as usize;
                if raw_offset > data.len() && section.size_of_raw_data != 0 {
                    return Err(malformed_error!(
                        "Section {} starts past the end of the file - 0x{:x}",
                        name,
                        raw_offset
                    ));
                }

                // Truncated files still expose whatever part of the section is present.
                let raw_size = (section.size_of_raw_data as usize)
                    .min(data.len().saturating_sub(raw_offset));

                headers.push(SectionHeader {
                    name,
                    virtual_address: u64::from(section.virtual_address),
                    virtual_size: u64::from(section.virtual_size),
                    raw_offset,
                    raw_size,
                    executable: section.characteristics
                        & (IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE)
                        != 0,
                });
            }

            (headers, pe.image_base as u64, pe.entry as u64, bitness)
        };

        Ok(PeImage {
            data: Box::new(data),
            headers,
            image_base,
            entry_point,
            bitness,
        })
    }

    /// Returns the total size of the loaded file in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the file has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Returns the preferred load address of the image.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// Returns the RVA of the image entry point.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// Returns the raw file data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }
}

impl Image for PeImage {
    fn section_count(&self) -> usize {
        self.headers.len()
    }

    fn section(&self, index: usize) -> Option<Section<'_>> {
        let header = self.headers.get(index)?;
        Some(Section {
            name: header.name.as_str(),
            virtual_address: header.virtual_address,
            virtual_size: header.virtual_size,
            file_offset: header.raw_offset as u64,
            data: self
                .data
                .data_slice(header.raw_offset, header.raw_size)
                .unwrap_or(&[]),
            executable: header.executable,
        })
    }

    fn bitness(&self) -> u32 {
        self.bitness
    }
}
