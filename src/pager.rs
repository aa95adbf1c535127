//! Owns the data-file descriptor, translates page ids to file offsets,
//! allocates/frees pages, caches them in memory, and drives crash recovery
//! ahead of every durable mutation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{Error, StorageError};
use crate::file_header::{FileHeader, MetaField, FILE_HEADER_SIZE};
use crate::page::{Page, PageType, INVALID_PAGE_ID, PAGE_SIZE};
use crate::wal::{Wal, WalRecord};

/// Default number of pages held in the in-memory cache.
pub const DEFAULT_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct PagerOptions {
    pub cache_size: usize,
    pub enable_wal: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            enable_wal: true,
        }
    }
}

struct CacheEntry {
    page: Page,
    dirty: bool,
    last_access: u64,
}

/// Owns the on-disk data file, the page cache, and (if enabled) the WAL.
pub struct Pager {
    file: File,
    header: FileHeader,
    wal: Option<Wal>,
    cache: HashMap<u32, CacheEntry>,
    options: PagerOptions,
    tick: u64,
    closed: bool,
}

fn file_offset(pid: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + pid as u64 * PAGE_SIZE as u64
}

fn wal_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".wal");
    PathBuf::from(name)
}

impl Pager {
    /// Open (creating if absent) the data file at `path`, performing crash
    /// recovery against its WAL.
    pub fn open<P: AsRef<Path>>(path: P, options: PagerOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let fresh = !path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let header = if fresh {
            let header = FileHeader::new(0);
            file.write_all(&header.to_bytes()?)?;
            file.set_len(FILE_HEADER_SIZE as u64 + PAGE_SIZE as u64)?;
            let meta = Page::new(INVALID_PAGE_ID, PageType::Meta);
            file.seek(SeekFrom::Start(file_offset(INVALID_PAGE_ID)))?;
            file.write_all(&meta.to_bytes()?)?;
            file.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            FileHeader::from_bytes(&buf)?
        };

        let mut pager = Self {
            file,
            header,
            wal: None,
            cache: HashMap::new(),
            options,
            tick: 0,
            closed: false,
        };

        validate_free_list(&mut pager.file, &pager.header)?;

        if options.enable_wal {
            let mut wal = Wal::open(wal_path_for(path))?;
            pager.recover(&mut wal)?;
            pager.wal = Some(wal);
        }

        Ok(pager)
    }

    fn recover(&mut self, wal: &mut Wal) -> Result<(), Error> {
        let records = wal.replay()?;
        if records.is_empty() {
            return Ok(());
        }
        eprintln!(
            "mono-store: replaying {} WAL record(s) from checkpoint lsn {}",
            records.len(),
            wal.checkpoint_lsn()
        );

        let mut alloc_types: HashMap<u32, u8> = HashMap::new();
        for (_lsn, record) in records {
            match record {
                WalRecord::PageWrite { page_id, bytes } => {
                    if bytes.len() == PAGE_SIZE {
                        self.file.seek(SeekFrom::Start(file_offset(page_id)))?;
                        self.file.write_all(&bytes)?;
                    }
                }
                WalRecord::AllocPage { page_id, page_type } => {
                    if page_id >= self.header.page_count {
                        self.header.page_count = page_id + 1;
                    }
                    alloc_types.insert(page_id, page_type);
                }
                WalRecord::FreePage { .. } => {}
                WalRecord::MetaUpdate {
                    field, new_value, ..
                } => {
                    self.header.apply_meta_update(field, new_value);
                }
                WalRecord::Commit | WalRecord::Checkpoint { .. } => {}
            }
        }

        let expected_len = FILE_HEADER_SIZE as u64 + self.header.page_count as u64 * PAGE_SIZE as u64;
        let actual_len = self.file.metadata()?.len();
        if actual_len < expected_len {
            let first_missing = ((actual_len - FILE_HEADER_SIZE as u64) / PAGE_SIZE as u64) as u32;
            eprintln!(
                "mono-store: extending data file from {actual_len} to {expected_len} bytes after crash (pages {first_missing}..{})",
                self.header.page_count
            );
            for pid in first_missing..self.header.page_count {
                let page_type = alloc_types
                    .get(&pid)
                    .copied()
                    .map(PageType::from_u8)
                    .transpose()?
                    .unwrap_or(PageType::Data);
                let page = Page::new(pid, page_type);
                self.file.seek(SeekFrom::Start(file_offset(pid)))?;
                self.file.write_all(&page.to_bytes()?)?;
            }
        }

        self.file.sync_all()?;
        self.write_header()?;
        validate_free_list(&mut self.file, &self.header)?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes()?)?;
        Ok(())
    }

    fn wal_ahead(&mut self, records: Vec<WalRecord>) -> Result<(), Error> {
        if let Some(wal) = self.wal.as_mut() {
            for record in records {
                wal.append(record)?;
            }
            wal.flush()?;
        }
        Ok(())
    }

    /// Pop the head of the free-list, or extend the file by one page.
    /// WAL-ahead in both cases.
    pub fn alloc_page(&mut self, page_type: PageType) -> Result<Page, Error> {
        if self.header.free_list_head != INVALID_PAGE_ID {
            let pid = self.header.free_list_head;
            let free_page = self.read_page_uncached(pid)?;
            let new_head = free_page.next_page_id;

            self.wal_ahead(vec![
                WalRecord::AllocPage {
                    page_id: pid,
                    page_type: page_type as u8,
                },
                WalRecord::MetaUpdate {
                    field: MetaField::FreeListHead,
                    old_value: pid,
                    new_value: new_head,
                },
            ])?;

            self.header.free_list_head = new_head;
            let page = Page::new(pid, page_type);
            self.write_page_direct(&page)?;
            self.cache_insert(page.clone(), false);
            return Ok(page);
        }

        let pid = self.header.page_count;
        self.wal_ahead(vec![
            WalRecord::AllocPage {
                page_id: pid,
                page_type: page_type as u8,
            },
            WalRecord::MetaUpdate {
                field: MetaField::PageCount,
                old_value: pid,
                new_value: pid + 1,
            },
        ])?;

        self.header.page_count = pid + 1;
        let page = Page::new(pid, page_type);
        self.write_page_direct(&page)?;
        self.cache_insert(page.clone(), false);
        Ok(page)
    }

    /// Return `pid` to the free-list. WAL-ahead, then written through
    /// immediately (not merely marked dirty).
    pub fn free_page(&mut self, pid: u32) -> Result<(), Error> {
        let old_head = self.header.free_list_head;
        self.wal_ahead(vec![
            WalRecord::FreePage { page_id: pid },
            WalRecord::MetaUpdate {
                field: MetaField::FreeListHead,
                old_value: old_head,
                new_value: pid,
            },
        ])?;

        let mut page = self.read_page(pid)?;
        page.page_type = PageType::Free;
        page.next_page_id = old_head;
        self.write_page_direct(&page)?;
        self.cache_insert(page, false);
        self.header.free_list_head = pid;
        Ok(())
    }

    /// Read a page, preferring the cache.
    pub fn read_page(&mut self, pid: u32) -> Result<Page, Error> {
        self.tick += 1;
        if let Some(entry) = self.cache.get_mut(&pid) {
            entry.last_access = self.tick;
            return Ok(entry.page.clone());
        }
        let page = self.read_page_uncached(pid)?;
        self.evict_if_needed()?;
        self.cache.insert(
            pid,
            CacheEntry {
                page: page.clone(),
                dirty: false,
                last_access: self.tick,
            },
        );
        Ok(page)
    }

    fn read_page_uncached(&mut self, pid: u32) -> Result<Page, Error> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(file_offset(pid)))?;
        self.file.read_exact(&mut buf)?;
        Page::from_bytes(&buf)
    }

    /// Mark `page` dirty in the cache.
    pub fn write_page(&mut self, page: Page) -> Result<(), Error> {
        self.cache_insert(page, true);
        self.evict_if_needed()
    }

    fn cache_insert(&mut self, page: Page, dirty: bool) {
        self.tick += 1;
        let tick = self.tick;
        self.cache
            .entry(page.page_id)
            .and_modify(|e| {
                e.page = page.clone();
                e.dirty = e.dirty || dirty;
                e.last_access = tick;
            })
            .or_insert(CacheEntry {
                page,
                dirty,
                last_access: tick,
            });
    }

    fn evict_if_needed(&mut self) -> Result<(), Error> {
        while self.cache.len() > self.options.cache_size {
            let clean_victim = self
                .cache
                .iter()
                .filter(|(_, e)| !e.dirty)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(pid, _)| *pid);

            let victim = match clean_victim {
                Some(pid) => pid,
                None => {
                    let pid = self
                        .cache
                        .iter()
                        .min_by_key(|(_, e)| e.last_access)
                        .map(|(pid, _)| *pid)
                        .expect("cache is non-empty");
                    let page = self.cache[&pid].page.clone();
                    self.write_page_direct(&page)?;
                    pid
                }
            };
            self.cache.remove(&victim);
        }
        Ok(())
    }

    /// Append a `PageWrite` record (if WAL-enabled) then write the page's
    /// bytes directly to the data file. No per-write fsync.
    fn write_page_direct(&mut self, page: &Page) -> Result<(), Error> {
        let bytes = page.to_bytes()?;
        if let Some(wal) = self.wal.as_mut() {
            wal.append(WalRecord::PageWrite {
                page_id: page.page_id,
                bytes: bytes.clone(),
            })?;
        }
        self.file.seek(SeekFrom::Start(file_offset(page.page_id)))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Write every dirty cache entry through, commit the WAL, and fsync
    /// both the WAL and the data file.
    pub fn flush(&mut self) -> Result<(), Error> {
        let dirty: Vec<Page> = self
            .cache
            .values()
            .filter(|e| e.dirty)
            .map(|e| e.page.clone())
            .collect();
        for page in &dirty {
            self.write_page_direct(page)?;
        }
        for entry in self.cache.values_mut() {
            entry.dirty = false;
        }

        if let Some(wal) = self.wal.as_mut() {
            wal.append(WalRecord::Commit)?;
            wal.flush()?;
        }
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flush, then checkpoint the WAL and truncate it.
    pub fn checkpoint(&mut self) -> Result<(), Error> {
        self.flush()?;
        if let Some(wal) = self.wal.as_mut() {
            wal.checkpoint()?;
        }
        Ok(())
    }

    pub fn catalog_page_id(&self) -> u32 {
        self.header.catalog_page_id
    }

    pub fn set_catalog_page_id(&mut self, pid: u32) -> Result<(), Error> {
        let old = self.header.catalog_page_id;
        self.wal_ahead(vec![WalRecord::MetaUpdate {
            field: MetaField::CatalogPageId,
            old_value: old,
            new_value: pid,
        }])?;
        self.header.catalog_page_id = pid;
        Ok(())
    }

    /// Flush and close. A second call is a no-op.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Walk the free-list from `header.free_list_head`, guarding against a
/// cycle longer than `pageCount`.
fn validate_free_list(file: &mut File, header: &FileHeader) -> Result<(), Error> {
    let mut pid = header.free_list_head;
    let mut steps = 0u32;
    while pid != INVALID_PAGE_ID {
        steps += 1;
        if steps > header.page_count {
            return Err(StorageError::CorruptFreeList(format!(
                "free-list chain exceeds page_count={}",
                header.page_count
            ))
            .into());
        }
        let mut buf = [0u8; 4];
        file.seek(SeekFrom::Start(file_offset(pid) + 10))?;
        file.read_exact(&mut buf)?;
        pid = u32::from_le_bytes(buf);
    }
    Ok(())
}
