//! Slot-directory operations layered on a page's data area.
//!
//! Mirrors the teacher's `InternalPage`/`LeafPage` pattern: a zero-copy view
//! struct borrowing the page's data area, bounds-checked little-endian field
//! helpers, and a page-local error enum. Unlike those page-type-specific
//! structs, one `SlottedPage` serves every page type (data records and B+
//! tree nodes alike), since the format is shared.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::page::{Page, MAX_PAGE_DATA};

const SLOT_SIZE: usize = 6;
const SLOT_OFF_OFFSET: usize = 0;
const SLOT_OFF_LENGTH: usize = 2;
const SLOT_OFF_FLAGS: usize = 4;

/// Set on a slot by `delete`; the slot stays in the directory (indices are
/// stable) but `getData` treats it as absent.
pub const SLOT_FLAG_DELETED: u16 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlottedPageError {
    #[error("page full")]
    PageFull,

    #[error("page corrupt: {0}")]
    Corrupt(String),
}

/// Maps a pre-`compact` slot index to its post-`compact` index, for callers
/// holding outside references (e.g. a B+ tree node's parent/child links).
pub type CompactMap = Vec<usize>;

/// A view over one page's slot directory and data area.
pub struct SlottedPage<'a> {
    page: &'a mut Page,
}

impl<'a> SlottedPage<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    pub fn item_count(&self) -> usize {
        self.page.item_count as usize
    }

    /// Insert `data` as a new slot, returning its index.
    pub fn insert(&mut self, data: &[u8]) -> Result<usize, SlottedPageError> {
        let item_count = self.item_count();
        let min_live = self.min_live_record_offset()?;
        let need = (item_count + 1) * SLOT_SIZE + data.len();
        if need > min_live {
            return Err(SlottedPageError::PageFull);
        }

        let new_offset = min_live - data.len();
        let buf = &mut self.page.data;
        buf[new_offset..new_offset + data.len()].copy_from_slice(data);
        write_slot(buf, item_count, new_offset as u16, data.len() as u16, 0)?;

        self.page.item_count = (item_count + 1) as u16;
        self.recompute_free_space()?;
        Ok(item_count)
    }

    /// Overwrite the slot at `index` with `data`. Rewrites in place if the
    /// new bytes fit the existing record footprint, otherwise tombstones
    /// the old slot and appends the new bytes under the same index.
    pub fn update(&mut self, index: usize, data: &[u8]) -> Result<(), SlottedPageError> {
        let (offset, length, flags) = self.read_slot(index)?;
        if flags & SLOT_FLAG_DELETED != 0 {
            return Err(SlottedPageError::Corrupt(format!(
                "update of deleted slot {index}"
            )));
        }

        if data.len() <= length as usize {
            let buf = &mut self.page.data;
            let off = offset as usize;
            buf[off..off + data.len()].copy_from_slice(data);
            write_slot(buf, index, offset, data.len() as u16, flags)?;
            self.recompute_free_space()?;
            return Ok(());
        }

        let min_live = self.min_live_record_offset()?;
        let item_count = self.item_count();
        let need = item_count * SLOT_SIZE + data.len();
        if need > min_live {
            return Err(SlottedPageError::PageFull);
        }
        let new_offset = min_live - data.len();
        let buf = &mut self.page.data;
        buf[new_offset..new_offset + data.len()].copy_from_slice(data);
        write_slot(buf, index, offset, length, flags | SLOT_FLAG_DELETED)?;
        write_slot(buf, index, new_offset as u16, data.len() as u16, 0)?;
        self.recompute_free_space()?;
        Ok(())
    }

    /// Tombstone the slot at `index`. `itemCount` is unchanged; the index
    /// stays valid and simply reads back as absent.
    pub fn delete(&mut self, index: usize) -> Result<(), SlottedPageError> {
        let (offset, length, flags) = self.read_slot(index)?;
        write_slot(
            &mut self.page.data,
            index,
            offset,
            length,
            flags | SLOT_FLAG_DELETED,
        )?;
        self.recompute_free_space()?;
        Ok(())
    }

    /// Borrowed view of the bytes at `index`, or `None` if the slot is out
    /// of range, zero-length, or deleted.
    pub fn get_data(&self, index: usize) -> Option<&[u8]> {
        let (offset, length, flags) = self.read_slot(index).ok()?;
        if flags & SLOT_FLAG_DELETED != 0 || length == 0 {
            return None;
        }
        let off = offset as usize;
        Some(&self.page.data[off..off + length as usize])
    }

    /// Rewrite the page to remove fragmentation and tombstones. Returns the
    /// old-index to new-index map; deleted slots map to nothing and are
    /// absent from the map's domain.
    pub fn compact(&mut self) -> Result<CompactMap, SlottedPageError> {
        let item_count = self.item_count();
        let mut live: Vec<(usize, Vec<u8>)> = Vec::new();
        for i in 0..item_count {
            let (offset, length, flags) = self.read_slot(i)?;
            if flags & SLOT_FLAG_DELETED != 0 || length == 0 {
                continue;
            }
            let off = offset as usize;
            live.push((i, self.page.data[off..off + length as usize].to_vec()));
        }

        let mut new_data = vec![0u8; MAX_PAGE_DATA];
        let mut cursor = MAX_PAGE_DATA;
        let mut map = vec![usize::MAX; item_count];
        for (new_idx, (old_idx, bytes)) in live.iter().enumerate() {
            cursor -= bytes.len();
            new_data[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            write_slot(&mut new_data, new_idx, cursor as u16, bytes.len() as u16, 0)?;
            map[*old_idx] = new_idx;
        }

        self.page.data = new_data;
        self.page.item_count = live.len() as u16;
        self.recompute_free_space()?;
        Ok(map)
    }

    /// Bytes currently usable for a new record of any size, i.e. the gap
    /// between the end of the slot directory and the lowest live or
    /// tombstoned record.
    pub fn free_space(&self) -> usize {
        let item_count = self.item_count();
        match self.min_live_record_offset() {
            Ok(min_live) => min_live.saturating_sub(item_count * SLOT_SIZE),
            Err(_) => 0,
        }
    }

    fn min_live_record_offset(&self) -> Result<usize, SlottedPageError> {
        let item_count = self.item_count();
        let mut min_off = MAX_PAGE_DATA;
        for i in 0..item_count {
            let (offset, length, _flags) = self.read_slot(i)?;
            if length == 0 {
                continue;
            }
            min_off = min_off.min(offset as usize);
        }
        Ok(min_off)
    }

    fn recompute_free_space(&mut self) -> Result<(), SlottedPageError> {
        self.page.free_space = self.free_space() as u16;
        Ok(())
    }

    fn read_slot(&self, index: usize) -> Result<(u16, u16, u16), SlottedPageError> {
        let item_count = self.item_count();
        if index >= item_count {
            return Err(SlottedPageError::Corrupt(format!(
                "slot index out of bounds: {index} (item_count={item_count})"
            )));
        }
        let base = index * SLOT_SIZE;
        let buf = &self.page.data;
        let offset = read_u16(buf, base + SLOT_OFF_OFFSET)?;
        let length = read_u16(buf, base + SLOT_OFF_LENGTH)?;
        let flags = read_u16(buf, base + SLOT_OFF_FLAGS)?;
        if length != 0 && (offset as usize + length as usize > MAX_PAGE_DATA) {
            return Err(SlottedPageError::Corrupt(format!(
                "record out of bounds: offset={offset} length={length}"
            )));
        }
        Ok((offset, length, flags))
    }
}

fn write_slot(
    buf: &mut [u8],
    index: usize,
    offset: u16,
    length: u16,
    flags: u16,
) -> Result<(), SlottedPageError> {
    let base = index * SLOT_SIZE;
    write_u16(buf, base + SLOT_OFF_OFFSET, offset)?;
    write_u16(buf, base + SLOT_OFF_LENGTH, length)?;
    write_u16(buf, base + SLOT_OFF_FLAGS, flags)?;
    Ok(())
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16, SlottedPageError> {
    if off + 2 > buf.len() {
        return Err(SlottedPageError::Corrupt("read_u16 out of bounds".into()));
    }
    (&buf[off..off + 2])
        .read_u16::<LittleEndian>()
        .map_err(|e| SlottedPageError::Corrupt(e.to_string()))
}

fn write_u16(buf: &mut [u8], off: usize, v: u16) -> Result<(), SlottedPageError> {
    if off + 2 > buf.len() {
        return Err(SlottedPageError::Corrupt("write_u16 out of bounds".into()));
    }
    (&mut buf[off..off + 2])
        .write_u16::<LittleEndian>(v)
        .map_err(|e| SlottedPageError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;

    #[test]
    fn insert_and_get_round_trip() {
        let mut page = Page::new(1, PageType::Data);
        let mut sp = SlottedPage::new(&mut page);
        let a = sp.insert(b"hello").unwrap();
        let b = sp.insert(b"world!").unwrap();
        assert_eq!(sp.get_data(a), Some(&b"hello"[..]));
        assert_eq!(sp.get_data(b), Some(&b"world!"[..]));
    }

    #[test]
    fn delete_keeps_index_stable_but_hides_data() {
        let mut page = Page::new(1, PageType::Data);
        let mut sp = SlottedPage::new(&mut page);
        let a = sp.insert(b"one").unwrap();
        let b = sp.insert(b"two").unwrap();
        sp.delete(a).unwrap();
        assert_eq!(sp.get_data(a), None);
        assert_eq!(sp.get_data(b), Some(&b"two"[..]));
        assert_eq!(sp.item_count(), 2);
    }

    #[test]
    fn update_in_place_when_it_fits() {
        let mut page = Page::new(1, PageType::Data);
        let mut sp = SlottedPage::new(&mut page);
        let a = sp.insert(b"abcde").unwrap();
        sp.update(a, b"xy").unwrap();
        assert_eq!(sp.get_data(a), Some(&b"xy"[..]));
    }

    #[test]
    fn update_relocates_when_it_does_not_fit() {
        let mut page = Page::new(1, PageType::Data);
        let mut sp = SlottedPage::new(&mut page);
        let a = sp.insert(b"ab").unwrap();
        sp.update(a, b"a much longer value than before").unwrap();
        assert_eq!(
            sp.get_data(a),
            Some(&b"a much longer value than before"[..])
        );
    }

    #[test]
    fn compact_remaps_indices_and_drops_tombstones() {
        let mut page = Page::new(1, PageType::Data);
        let mut sp = SlottedPage::new(&mut page);
        let a = sp.insert(b"first").unwrap();
        let b = sp.insert(b"second").unwrap();
        let c = sp.insert(b"third").unwrap();
        sp.delete(b).unwrap();

        let map = sp.compact().unwrap();
        assert_eq!(map[b], usize::MAX);
        let new_a = map[a];
        let new_c = map[c];
        assert_eq!(sp.get_data(new_a), Some(&b"first"[..]));
        assert_eq!(sp.get_data(new_c), Some(&b"third"[..]));
        assert_eq!(sp.item_count(), 2);
    }

    #[test]
    fn insert_fails_when_page_is_full() {
        let mut page = Page::new(1, PageType::Data);
        let mut sp = SlottedPage::new(&mut page);
        let chunk = vec![0u8; 400];
        loop {
            if sp.insert(&chunk).is_err() {
                break;
            }
        }
    }
}
