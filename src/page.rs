//! Raw page framing: the 24-byte header every page carries, the XOR
//! checksum over its data area, and pack/unpack to/from the 4096-byte
//! on-disk representation.
//!
//! The slot-directory operations that make a page's data area a "slotted
//! page" live in `slotted_page`; this module only knows about the header
//! and the checksum.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Error, StorageError};

/// Size of a page on disk, including its header.
pub const PAGE_SIZE: usize = 4096;
/// Size of the page header (everything before the data area).
pub const PAGE_HEADER_SIZE: usize = 24;
/// Size of the data area that slot directory and records share.
pub const MAX_PAGE_DATA: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
/// Page id that never names a real page: the free-list sentinel, the
/// initial `prev`/`next`/`parent` value, and the id of the reserved meta
/// page.
pub const INVALID_PAGE_ID: u32 = 0;

const HDR_PAGE_ID: usize = 0;
const HDR_PAGE_TYPE: usize = 4;
const HDR_FLAGS: usize = 5;
const HDR_ITEM_COUNT: usize = 6;
const HDR_FREE_SPACE: usize = 8;
const HDR_NEXT_PAGE_ID: usize = 10;
const HDR_PREV_PAGE_ID: usize = 14;
const HDR_CHECKSUM: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Page is on the free-list; only `nextPageId` is meaningful.
    Free = 0,
    /// The reserved page 0.
    Meta = 1,
    /// A slotted page of opaque records (primary/secondary store payload).
    Data = 2,
    /// A B+ tree leaf node.
    BTreeLeaf = 3,
    /// A B+ tree internal node.
    BTreeInternal = 4,
}

impl PageType {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(PageType::Free),
            1 => Ok(PageType::Meta),
            2 => Ok(PageType::Data),
            3 => Ok(PageType::BTreeLeaf),
            4 => Ok(PageType::BTreeInternal),
            other => Err(StorageError::CorruptPage {
                page_id: 0,
                detail: format!("unknown page type: {other}"),
            }
            .into()),
        }
    }
}

/// An in-memory page: header fields plus the raw data-area bytes.
///
/// `data` is always exactly `MAX_PAGE_DATA` bytes. Slot-directory semantics
/// are layered on top by `slotted_page`.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: u32,
    pub page_type: PageType,
    pub flags: u8,
    pub item_count: u16,
    pub free_space: u16,
    pub next_page_id: u32,
    pub prev_page_id: u32,
    pub data: Vec<u8>,
}

impl Page {
    /// A freshly zeroed page of the given type, ready for slot-directory
    /// initialization.
    pub fn new(page_id: u32, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            flags: 0,
            item_count: 0,
            free_space: MAX_PAGE_DATA as u16,
            next_page_id: INVALID_PAGE_ID,
            prev_page_id: INVALID_PAGE_ID,
            data: vec![0u8; MAX_PAGE_DATA],
        }
    }

    /// Serialize to exactly `PAGE_SIZE` bytes, computing the checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        debug_assert_eq!(self.data.len(), MAX_PAGE_DATA);
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.write_u32::<LittleEndian>(self.page_id)?;
        buf.write_u8(self.page_type as u8)?;
        buf.write_u8(self.flags)?;
        buf.write_u16::<LittleEndian>(self.item_count)?;
        buf.write_u16::<LittleEndian>(self.free_space)?;
        buf.write_u32::<LittleEndian>(self.next_page_id)?;
        buf.write_u32::<LittleEndian>(self.prev_page_id)?;
        let checksum = xor_checksum(&self.data);
        buf.write_u32::<LittleEndian>(checksum)?;
        buf.write_all(&[0u8; 2])?;
        debug_assert_eq!(buf.len(), PAGE_HEADER_SIZE);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse from exactly `PAGE_SIZE` bytes, verifying the checksum.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != PAGE_SIZE {
            return Err(StorageError::CorruptPage {
                page_id: 0,
                detail: format!("expected {PAGE_SIZE} bytes, got {}", buf.len()),
            }
            .into());
        }

        let page_id = (&buf[HDR_PAGE_ID..]).read_u32::<LittleEndian>()?;
        let page_type = PageType::from_u8(buf[HDR_PAGE_TYPE]).map_err(|_| {
            Error::from(StorageError::CorruptPage {
                page_id,
                detail: format!("unknown page type: {}", buf[HDR_PAGE_TYPE]),
            })
        })?;
        let flags = buf[HDR_FLAGS];
        let item_count = (&buf[HDR_ITEM_COUNT..]).read_u16::<LittleEndian>()?;
        let free_space = (&buf[HDR_FREE_SPACE..]).read_u16::<LittleEndian>()?;
        let next_page_id = (&buf[HDR_NEXT_PAGE_ID..]).read_u32::<LittleEndian>()?;
        let prev_page_id = (&buf[HDR_PREV_PAGE_ID..]).read_u32::<LittleEndian>()?;
        let stored_checksum = (&buf[HDR_CHECKSUM..]).read_u32::<LittleEndian>()?;

        let data = buf[PAGE_HEADER_SIZE..].to_vec();
        let computed = xor_checksum(&data);
        if computed != stored_checksum {
            return Err(StorageError::CorruptPage {
                page_id,
                detail: format!(
                    "checksum mismatch: stored={stored_checksum:#010x} computed={computed:#010x}"
                ),
            }
            .into());
        }

        Ok(Self {
            page_id,
            page_type,
            flags,
            item_count,
            free_space,
            next_page_id,
            prev_page_id,
            data,
        })
    }
}

/// XOR of all u32 words in `data`, with any trailing 1-3 bytes zero-padded
/// into a final u32 word.
pub fn xor_checksum(data: &[u8]) -> u32 {
    let mut acc = 0u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        acc ^= u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        acc ^= u32::from_le_bytes(last);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_data() {
        let mut page = Page::new(7, PageType::Data);
        page.item_count = 3;
        page.free_space = 100;
        page.next_page_id = 9;
        page.prev_page_id = 5;
        page.data[0] = 0xAB;
        page.data[MAX_PAGE_DATA - 1] = 0xCD;

        let bytes = page.to_bytes().unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE);

        let parsed = Page::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.page_id, 7);
        assert_eq!(parsed.page_type, PageType::Data);
        assert_eq!(parsed.item_count, 3);
        assert_eq!(parsed.free_space, 100);
        assert_eq!(parsed.next_page_id, 9);
        assert_eq!(parsed.prev_page_id, 5);
        assert_eq!(parsed.data, page.data);
    }

    #[test]
    fn bit_flip_in_data_area_is_rejected() {
        let page = Page::new(1, PageType::Data);
        let mut bytes = page.to_bytes().unwrap();
        bytes[PAGE_HEADER_SIZE] ^= 0x01;
        let err = Page::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::CorruptPage { .. })
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Page::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::CorruptPage { .. })
        ));
    }
}
