//! The 64-byte database file header: bytes `[0, 64)` of the data file.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Error, StorageError};
use crate::page::INVALID_PAGE_ID;

pub const FILE_HEADER_SIZE: usize = 64;
pub const FILE_MAGIC: u32 = 0x4D4F4E4F;
pub const FILE_VERSION: u16 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 6;
const OFF_PAGE_COUNT: usize = 8;
const OFF_FREE_LIST_HEAD: usize = 12;
const OFF_META_PAGE_ID: usize = 16;
const OFF_CATALOG_PAGE_ID: usize = 20;
const OFF_CREATE_TIME: usize = 24;
const OFF_MODIFY_TIME: usize = 32;

/// Meta-field ids named by WAL `MetaUpdate` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaField {
    FreeListHead = 1,
    PageCount = 2,
    CatalogPageId = 3,
}

impl MetaField {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(MetaField::FreeListHead),
            2 => Ok(MetaField::PageCount),
            3 => Ok(MetaField::CatalogPageId),
            other => Err(StorageError::CorruptWal(format!("unknown meta field: {other}")).into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: u16,
    pub page_size: u16,
    pub page_count: u32,
    pub free_list_head: u32,
    pub meta_page_id: u32,
    pub catalog_page_id: u32,
    pub create_time: u64,
    pub modify_time: u64,
}

impl FileHeader {
    pub fn new(now: u64) -> Self {
        Self {
            version: FILE_VERSION,
            page_size: crate::page::PAGE_SIZE as u16,
            page_count: 1,
            free_list_head: INVALID_PAGE_ID,
            meta_page_id: INVALID_PAGE_ID,
            catalog_page_id: INVALID_PAGE_ID,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn apply_meta_update(&mut self, field: MetaField, new_value: u32) {
        match field {
            MetaField::FreeListHead => self.free_list_head = new_value,
            MetaField::PageCount => self.page_count = new_value,
            MetaField::CatalogPageId => self.catalog_page_id = new_value,
        }
    }

    pub fn meta_value(&self, field: MetaField) -> u32 {
        match field {
            MetaField::FreeListHead => self.free_list_head,
            MetaField::PageCount => self.page_count,
            MetaField::CatalogPageId => self.catalog_page_id,
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; FILE_HEADER_SIZE], Error> {
        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE);
        buf.write_u32::<LittleEndian>(FILE_MAGIC)?;
        buf.write_u16::<LittleEndian>(self.version)?;
        buf.write_u16::<LittleEndian>(self.page_size)?;
        buf.write_u32::<LittleEndian>(self.page_count)?;
        buf.write_u32::<LittleEndian>(self.free_list_head)?;
        buf.write_u32::<LittleEndian>(self.meta_page_id)?;
        buf.write_u32::<LittleEndian>(self.catalog_page_id)?;
        buf.write_u64::<LittleEndian>(self.create_time)?;
        buf.write_u64::<LittleEndian>(self.modify_time)?;
        buf.write_all(&[0u8; FILE_HEADER_SIZE - OFF_MODIFY_TIME - 8])?;
        let mut out = [0u8; FILE_HEADER_SIZE];
        out.copy_from_slice(&buf);
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != FILE_HEADER_SIZE {
            return Err(StorageError::CorruptPage {
                page_id: 0,
                detail: format!(
                    "expected {FILE_HEADER_SIZE}-byte file header, got {}",
                    buf.len()
                ),
            }
            .into());
        }
        let magic = (&buf[OFF_MAGIC..]).read_u32::<LittleEndian>()?;
        if magic != FILE_MAGIC {
            return Err(StorageError::CorruptPage {
                page_id: 0,
                detail: format!("bad file magic: {magic:#010x}"),
            }
            .into());
        }
        Ok(Self {
            version: (&buf[OFF_VERSION..]).read_u16::<LittleEndian>()?,
            page_size: (&buf[OFF_PAGE_SIZE..]).read_u16::<LittleEndian>()?,
            page_count: (&buf[OFF_PAGE_COUNT..]).read_u32::<LittleEndian>()?,
            free_list_head: (&buf[OFF_FREE_LIST_HEAD..]).read_u32::<LittleEndian>()?,
            meta_page_id: (&buf[OFF_META_PAGE_ID..]).read_u32::<LittleEndian>()?,
            catalog_page_id: (&buf[OFF_CATALOG_PAGE_ID..]).read_u32::<LittleEndian>()?,
            create_time: (&buf[OFF_CREATE_TIME..]).read_u64::<LittleEndian>()?,
            modify_time: (&buf[OFF_MODIFY_TIME..]).read_u64::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut h = FileHeader::new(1000);
        h.page_count = 5;
        h.free_list_head = 3;
        h.catalog_page_id = 2;
        let bytes = h.to_bytes().unwrap();
        let parsed = FileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.page_count, 5);
        assert_eq!(parsed.free_list_head, 3);
        assert_eq!(parsed.catalog_page_id, 2);
        assert_eq!(parsed.create_time, 1000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FileHeader::new(0).to_bytes().unwrap();
        bytes[0] ^= 0xFF;
        assert!(FileHeader::from_bytes(&bytes).is_err());
    }
}
