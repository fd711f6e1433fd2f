// 4 KiB pages addressed by 64-bit page numbers. Page 0 holds the master
// page, so pointer 0 doubles as the null pointer; every allocated page
// has a number >= 1.
pub const PAGE_SIZE: usize = 4096;

// node header: type(2B) + nkeys(2B)
pub const HEADER: usize = 4;

// a single key-value pair plus overhead must fit in one page
pub const MAX_KEY_LEN: usize = 1000;
pub const MAX_VALUE_LEN: usize = 3000;

pub type Ptr = u64;
