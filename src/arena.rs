//! Anonymous memory backing for hosts that do not bring their own buffer.

use crate::globals::BYTES_PER_BLOCK;

#[cfg(not(target_arch = "wasm32"))]
use memmap2::MmapMut;

#[cfg(not(target_arch = "wasm32"))]
pub struct Arena {
    map: MmapMut,
    size: usize,
}

#[cfg(not(target_arch = "wasm32"))]
impl Arena {
    pub fn new(size: usize) -> Self {
        let map = MmapMut::map_anon(size).expect("mmap failed");
        Self { map, size }
    }

    pub fn start(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.start().add(self.size) }
    }

    /// Return a block-aligned pointer into the region. Mapped memory is
    /// page aligned so this is normally `start` itself.
    pub fn aligned(&self) -> *mut u8 {
        let offset = (BYTES_PER_BLOCK - (self.start() as usize) % BYTES_PER_BLOCK)
            % BYTES_PER_BLOCK;
        unsafe { self.start().add(offset) }
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

#[cfg(target_arch = "wasm32")]
pub struct Arena {
    mem: *mut u8,
    size: usize,
}

#[cfg(target_arch = "wasm32")]
impl Arena {
    pub fn new(size: usize) -> Self {
        let mem = unsafe { libc::malloc(size).cast::<u8>() };
        assert!(!mem.is_null(), "malloc failed");
        Self { mem, size }
    }

    pub fn start(&self) -> *mut u8 {
        self.mem
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.mem.add(self.size) }
    }

    pub fn aligned(&self) -> *mut u8 {
        let offset = (BYTES_PER_BLOCK - (self.mem as usize) % BYTES_PER_BLOCK)
            % BYTES_PER_BLOCK;
        unsafe { self.mem.add(offset) }
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

#[cfg(target_arch = "wasm32")]
impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { libc::free(self.mem.cast()) };
    }
}
