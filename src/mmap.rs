//! Virtual memory backing the heap.
use crate::error::ConfigError;

/// Commits and decommits ranges of the reserved heap. Offsets are relative to the
/// start of the reservation and block aligned.
pub trait VirtualMemory: Send + Sync {
    /// Size of the reservation. The committed heap never exceeds it.
    fn reserved(&self) -> usize;
    fn commit(&self, offset: usize, size: usize) -> bool;
    fn decommit(&self, offset: usize, size: usize);
}

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;

    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    use super::VirtualMemory;
    use crate::error::ConfigError;

    pub struct ReservedSpace {
        start: *mut u8,
        size: usize,
    }

    unsafe impl Send for ReservedSpace {}
    unsafe impl Sync for ReservedSpace {}

    impl ReservedSpace {
        pub fn reserve(size: usize) -> Result<Self, ConfigError> {
            let mem = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
            if mem.is_null() {
                return Err(ConfigError::ReservationFailed(size));
            }
            Ok(Self {
                start: mem as *mut u8,
                size,
            })
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
    }

    impl VirtualMemory for ReservedSpace {
        fn reserved(&self) -> usize {
            self.size
        }

        fn commit(&self, offset: usize, size: usize) -> bool {
            debug_assert!(offset + size <= self.size);
            unsafe {
                !VirtualAlloc(self.start.add(offset).cast(), size, MEM_COMMIT, PAGE_READWRITE)
                    .is_null()
            }
        }

        fn decommit(&self, offset: usize, size: usize) {
            unsafe {
                VirtualFree(self.start.add(offset).cast(), size, MEM_DECOMMIT);
            }
        }
    }

    impl Drop for ReservedSpace {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use super::VirtualMemory;
    use crate::error::ConfigError;

    pub struct ReservedSpace {
        start: *mut u8,
        size: usize,
    }

    unsafe impl Send for ReservedSpace {}
    unsafe impl Sync for ReservedSpace {}

    impl ReservedSpace {
        pub fn reserve(size: usize) -> Result<Self, ConfigError> {
            let map = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if map == libc::MAP_FAILED {
                return Err(ConfigError::ReservationFailed(size));
            }
            Ok(Self {
                start: map as *mut u8,
                size,
            })
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
    }

    impl VirtualMemory for ReservedSpace {
        fn reserved(&self) -> usize {
            self.size
        }

        fn commit(&self, offset: usize, size: usize) -> bool {
            debug_assert!(offset + size <= self.size);
            unsafe {
                let page = self.start.add(offset) as *mut libc::c_void;
                if libc::mprotect(page, size as _, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                    return false;
                }
                libc::madvise(page, size as _, libc::MADV_WILLNEED);
            }
            true
        }

        fn decommit(&self, offset: usize, size: usize) {
            unsafe {
                let page = self.start.add(offset) as *mut libc::c_void;
                libc::madvise(page, size as _, libc::MADV_DONTNEED);
                libc::mprotect(page, size as _, libc::PROT_NONE);
            }
        }
    }

    impl Drop for ReservedSpace {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

/// Reserves `size` bytes of address space for a heap.
pub fn reserve(size: usize) -> Result<Box<dyn VirtualMemory>, ConfigError> {
    Ok(Box::new(ReservedSpace::reserve(size)?))
}
