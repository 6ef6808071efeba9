//! embedded-datalog - embedded filesystem collaborator contract
//!
//! The filesystem library itself is an external collaborator; this module
//! holds the two interfaces the storage engine touches it through: the
//! [`Filesystem`] trait consumed by the log-file controller, and the
//! block-callback [`StorageAdapter`](storage::StorageAdapter) the
//! filesystem drives the card through.

pub mod storage;

use core::fmt::Debug;

/// Bytes of index pointer the filesystem reserves in logical block `index`
/// of a file. Block 0 stores data exclusively; block `n` carries
/// `trailing_zeros(n) + 1` 32-bit back-pointers of the logarithmic
/// skip-list it threads through the file.
pub fn block_overhead(index: u32) -> u32 {
    if index == 0 {
        0
    } else {
        4 * (index.trailing_zeros() + 1)
    }
}

/// How many bytes may be appended to a file of length `file_len` before the
/// write crosses into the next logical block.
///
/// Writing exactly up to this boundary and syncing there keeps the
/// filesystem from having to copy-and-relocate a partially-written block,
/// which is its documented worst-case latency pathology. `block_size` is
/// the filesystem's logical block size, a power of two.
pub fn bytes_to_boundary(block_size: u32, file_len: u32) -> u32 {
    debug_assert!(block_size.is_power_of_two());
    let mut remaining = file_len;
    let mut index = 0;
    loop {
        let capacity = block_size - block_overhead(index);
        if remaining < capacity {
            return capacity - remaining;
        }
        remaining -= capacity;
        index += 1;
    }
}

/// The operations the log-file controller performs against a mounted
/// filesystem. One implementation per filesystem binding; test code uses a
/// stub.
pub trait Filesystem {
    /// An open, writable file.
    type File;
    /// The filesystem's native error codes.
    type Error: Debug;

    /// Call `f` with the name of every file in the log directory.
    fn for_each_name<F>(&mut self, f: F) -> Result<(), Self::Error>
    where
        F: FnMut(&str);

    /// Create (and truncate) a file with this name, open for appending.
    fn create(&mut self, name: &str) -> Result<Self::File, Self::Error>;

    /// Append `data` to the file.
    fn append(&mut self, file: &mut Self::File, data: &[u8]) -> Result<(), Self::Error>;

    /// Commit everything appended so far to the media.
    fn sync_file(&mut self, file: &mut Self::File) -> Result<(), Self::Error>;

    /// Close the file. Called on rotation and on write failure alike.
    fn close(&mut self, file: Self::File) -> Result<(), Self::Error>;

    /// How many bytes may be appended to `file` before the write crosses
    /// the filesystem's per-block bookkeeping boundary (see
    /// [`bytes_to_boundary`]).
    fn bytes_until_sync_boundary(&self, file: &Self::File) -> u32;
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
