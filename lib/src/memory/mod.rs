pub mod address;
pub mod heap;
pub mod paging;
pub mod physical;

pub const PAGE_SIZE: usize = 4096;
