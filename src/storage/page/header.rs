use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

/// Fixed width of an index name in a header record
pub const MAX_NAME_LEN: usize = 32;

const COUNT_SIZE: usize = 4;
const RECORD_SIZE: usize = MAX_NAME_LEN + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - COUNT_SIZE) / RECORD_SIZE;

/// One `{index_name -> root_page_id}` entry on the header page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub name: String,
    pub root_page_id: PageId,
}

/// Decoded view of the header page (page 0).
///
/// The header page persists the root page ID of every index, as an array of
/// fixed-width `{name, page_id}` records behind a `u32` record count.
#[derive(Debug, Default)]
pub struct HeaderPage {
    records: Vec<HeaderRecord>,
}

impl HeaderPage {
    /// Decode the record table from raw page bytes
    pub fn from_page(page: &Page) -> Self {
        let count = LittleEndian::read_u32(&page.data[0..COUNT_SIZE]) as usize;
        let count = count.min(MAX_RECORDS);
        let mut records = Vec::with_capacity(count);

        for i in 0..count {
            let offset = COUNT_SIZE + i * RECORD_SIZE;
            let name_bytes = &page.data[offset..offset + MAX_NAME_LEN];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
            let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
            let root_page_id =
                LittleEndian::read_u32(&page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE]);
            records.push(HeaderRecord { name, root_page_id });
        }

        Self { records }
    }

    /// Encode the record table back into the page bytes
    pub fn write_to(&self, page: &mut Page) {
        page.reset();
        LittleEndian::write_u32(&mut page.data[0..COUNT_SIZE], self.records.len() as u32);

        for (i, record) in self.records.iter().enumerate() {
            let offset = COUNT_SIZE + i * RECORD_SIZE;
            let name_bytes = record.name.as_bytes();
            let len = name_bytes.len().min(MAX_NAME_LEN);
            page.data[offset..offset + len].copy_from_slice(&name_bytes[..len]);
            LittleEndian::write_u32(
                &mut page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE],
                record.root_page_id,
            );
        }
    }

    /// Insert a new record; rejects duplicates, over-long names, full page
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() >= MAX_NAME_LEN || self.records.len() >= MAX_RECORDS {
            return false;
        }
        if self.records.iter().any(|r| r.name == name) {
            return false;
        }
        self.records.push(HeaderRecord {
            name: name.to_string(),
            root_page_id,
        });
        true
    }

    /// Update the root page ID of an existing record
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.records.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.root_page_id = root_page_id;
                true
            }
            None => false,
        }
    }

    /// Remove a record by index name
    pub fn delete_record(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.name != name);
        self.records.len() != before
    }

    /// Look up the root page ID recorded for an index name
    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.root_page_id)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
