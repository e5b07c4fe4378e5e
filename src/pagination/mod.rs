//! Historical page loading.

mod cursor;

pub use cursor::{fetch_page, Cursor, PageOutcome, PageRequest, PageSource, PaginationCursor};
