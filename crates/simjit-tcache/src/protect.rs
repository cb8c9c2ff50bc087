use std::collections::HashMap;

use crate::GuestRange;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Write-protection bookkeeping for guest memory that backs translated code.
///
/// The cache tells the implementation which guest bytes its blocks were compiled from; the
/// implementation decides how writes to those bytes get trapped (page protection, a dirty
/// bitmap, ...). It only ever receives ranges and never calls back into the cache.
pub trait CodeProtection {
    /// A block compiled from `range` is now live.
    fn protect(&mut self, range: GuestRange);

    /// A block compiled from `range` is gone.
    fn unprotect(&mut self, range: GuestRange);

    /// Whether any byte of `range` still backs translated code.
    fn is_protected(&self, range: GuestRange) -> bool;

    /// Whether any page touched by `range` is write-protected.
    ///
    /// Coarser than [`CodeProtection::is_protected`]; used as the cheap first test on guest
    /// writes.
    fn page_protected(&self, range: GuestRange) -> bool {
        self.is_protected(range)
    }
}

/// Per-page reference counts for every byte of a protected page.
#[derive(Debug)]
struct PageMarks {
    refs: Box<[u32]>,
    /// Number of bytes in this page with a non-zero count.
    marked: usize,
}

impl PageMarks {
    fn new() -> Self {
        Self {
            refs: vec![0; PAGE_SIZE as usize].into_boxed_slice(),
            marked: 0,
        }
    }
}

/// Default [`CodeProtection`]: code-byte reference counts kept per 4 KiB page.
///
/// A page is write-protected for as long as at least one of its bytes backs code. Overlapping
/// blocks each hold their own reference, so evicting one of them leaves the bytes the other
/// still uses marked.
#[derive(Debug, Default)]
pub struct CodePageMap {
    pages: HashMap<u32, PageMarks>,
    pages_protected: u64,
    pages_unprotected: u64,
}

/// Split `range` into `(page, first_offset, end_offset)` pieces.
fn page_pieces(range: GuestRange) -> impl Iterator<Item = (u32, usize, usize)> {
    let start = range.start();
    let end = range.end();
    let first = start >> PAGE_SHIFT;
    let last = if end > start {
        (end - 1) >> PAGE_SHIFT
    } else {
        first
    };
    (first..=last)
        .filter(move |_| end > start)
        .map(move |page| {
            let page_base = page << PAGE_SHIFT;
            let lo = start.max(page_base) - page_base;
            let hi = end.min(page_base + PAGE_SIZE) - page_base;
            (page as u32, lo as usize, hi as usize)
        })
}

impl CodePageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages currently write-protected.
    pub fn protected_page_count(&self) -> usize {
        self.pages.len()
    }

    /// Protect transitions since creation.
    pub fn pages_protected(&self) -> u64 {
        self.pages_protected
    }

    /// Unprotect transitions since creation.
    pub fn pages_unprotected(&self) -> u64 {
        self.pages_unprotected
    }

    pub fn is_page_protected(&self, page: u32) -> bool {
        self.pages.contains_key(&page)
    }

    /// Drop every mark and protection.
    pub fn clear(&mut self) {
        self.pages_unprotected += self.pages.len() as u64;
        self.pages.clear();
    }
}

impl CodeProtection for CodePageMap {
    fn protect(&mut self, range: GuestRange) {
        for (page, lo, hi) in page_pieces(range) {
            let marks = self.pages.entry(page).or_insert_with(|| {
                tracing::trace!(page = format_args!("{:#07x}", page), "write-protecting code page");
                self.pages_protected += 1;
                PageMarks::new()
            });
            for count in &mut marks.refs[lo..hi] {
                if *count == 0 {
                    marks.marked += 1;
                }
                *count = count.saturating_add(1);
            }
        }
    }

    fn unprotect(&mut self, range: GuestRange) {
        for (page, lo, hi) in page_pieces(range) {
            let Some(marks) = self.pages.get_mut(&page) else {
                continue;
            };
            for count in &mut marks.refs[lo..hi] {
                if *count == 1 {
                    marks.marked -= 1;
                }
                *count = count.saturating_sub(1);
            }
            if marks.marked == 0 {
                tracing::trace!(page = format_args!("{:#07x}", page), "code page unprotected");
                self.pages.remove(&page);
                self.pages_unprotected += 1;
            }
        }
    }

    fn is_protected(&self, range: GuestRange) -> bool {
        page_pieces(range).any(|(page, lo, hi)| {
            self.pages
                .get(&page)
                .is_some_and(|marks| marks.refs[lo..hi].iter().any(|&c| c != 0))
        })
    }

    fn page_protected(&self, range: GuestRange) -> bool {
        page_pieces(range).any(|(page, _, _)| self.pages.contains_key(&page))
    }
}
