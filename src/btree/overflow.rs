//! Overflow chains for values that do not fit in a node cell.
//!
//! Chain page layout:
//!
//!   [type: u8 = OVERFLOW] [next: u32 BE, 0 = last] [chunk_len: u16 BE] [chunk ...] [crc]
//!
//! The cell keeps the first `OVERFLOW_INLINE` bytes of the value plus the
//! first chain page; the chain carries the remainder in order.

use crate::cancel::CancelToken;
use crate::error::{Result, TurError};
use crate::storage::page::{Page, PageNo, PageType, PAGE_TRAILER_SIZE};
use crate::storage::pager::Pager;

const CHAIN_HEADER: usize = 1 + 4 + 2;

fn chunk_capacity(page_size: usize) -> usize {
    page_size - CHAIN_HEADER - PAGE_TRAILER_SIZE
}

/// Write `rest` (the value minus its inline prefix) as a chain.
/// Returns the first page of the chain.
pub fn write_chain(pager: &Pager, rest: &[u8]) -> Result<PageNo> {
    debug_assert!(!rest.is_empty());
    let cap = chunk_capacity(pager.page_size());
    let chunks: Vec<&[u8]> = rest.chunks(cap).collect();

    // Allocate up front so each page can name its successor.
    let mut pages = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        pages.push(pager.allocate()?);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let next = if i + 1 < pages.len() { pages[i + 1] } else { 0 };
        let mut page = Page::with_type(pages[i], pager.page_size(), PageType::Overflow);
        let data = page.data_mut();
        data[1..5].copy_from_slice(&next.to_be_bytes());
        data[5..7].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
        data[CHAIN_HEADER..CHAIN_HEADER + chunk.len()].copy_from_slice(chunk);
        pager.write_page(page)?;
    }
    Ok(pages[0])
}

/// Reassemble a value: inline prefix plus the chain starting at `first`.
pub fn read_chain(
    pager: &Pager,
    cancel: &CancelToken,
    total_len: usize,
    inline: &[u8],
    first: PageNo,
) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(total_len);
    value.extend_from_slice(inline);
    let mut next = first;
    while next != 0 {
        cancel.check()?;
        let guard = pager.read_with(next, cancel)?;
        if guard.page_type() != Some(PageType::Overflow) {
            return Err(TurError::Corruption(format!(
                "page {} in overflow chain is not an OVERFLOW page",
                next
            )));
        }
        let data = guard.data();
        let chunk_len = u16::from_be_bytes(data[5..7].try_into().unwrap()) as usize;
        if CHAIN_HEADER + chunk_len > data.len() - PAGE_TRAILER_SIZE {
            return Err(TurError::CorruptPage(next));
        }
        value.extend_from_slice(&data[CHAIN_HEADER..CHAIN_HEADER + chunk_len]);
        if value.len() > total_len {
            return Err(TurError::Corruption(format!(
                "overflow chain at page {} longer than declared {} bytes",
                first, total_len
            )));
        }
        next = u32::from_be_bytes(data[1..5].try_into().unwrap());
    }
    if value.len() != total_len {
        return Err(TurError::Corruption(format!(
            "overflow chain at page {} yielded {} bytes, expected {}",
            first,
            value.len(),
            total_len
        )));
    }
    Ok(value)
}

/// Collect a chain's page numbers (so COW deletes can retire them).
pub fn chain_pages(pager: &Pager, cancel: &CancelToken, first: PageNo) -> Result<Vec<PageNo>> {
    let mut pages = Vec::new();
    let mut next = first;
    while next != 0 {
        cancel.check()?;
        pages.push(next);
        let guard = pager.read_with(next, cancel)?;
        if guard.page_type() != Some(PageType::Overflow) {
            return Err(TurError::Corruption(format!(
                "page {} in overflow chain is not an OVERFLOW page",
                next
            )));
        }
        next = u32::from_be_bytes(guard.data()[1..5].try_into().unwrap());
        if pages.len() > (u32::MAX / 2) as usize {
            return Err(TurError::Corruption("overflow chain cycle".into()));
        }
    }
    Ok(pages)
}
