//! On-disk free-page chain.
//!
//! Freed pages form a singly linked list starting at the header's
//! `freelist_head`. Each free page is rewritten as a `FREELIST` page whose
//! payload is the next free page number:
//!
//!   [type: u8 = 0x06] [next: u32 BE, 0 = end of chain] ... [crc trailer]
//!
//! `allocate` pops the head, `free` pushes; an empty chain extends the file.
//! The pager owns the chain; this module knows the page format.

use crate::error::{Result, TurError};
use crate::storage::page::{Page, PageNo, PageType};

/// Build the page image for a freed page linking to `next`.
pub fn encode_free_page(no: PageNo, page_size: usize, next: PageNo) -> Page {
    let mut page = Page::with_type(no, page_size, PageType::FreeList);
    page.data_mut()[1..5].copy_from_slice(&next.to_be_bytes());
    page
}

/// Read the next-pointer out of a `FREELIST` page.
pub fn next_free(page: &Page) -> Result<PageNo> {
    if page.page_type() != Some(PageType::FreeList) {
        return Err(TurError::Corruption(format!(
            "page {} is on the free chain but is not a FREELIST page",
            page.no()
        )));
    }
    Ok(u32::from_be_bytes(page.data()[1..5].try_into().unwrap()))
}
