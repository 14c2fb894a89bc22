//! Executable-memory manager
//!
//! Supplies read+write pages for code emission, flips committed ranges to
//! read+execute before they run, and flushes the instruction cache on
//! architectures that need it. Memory is organised as a list of
//! page-aligned blocks obtained from the OS by anonymous mapping; the
//! emission cursor always lives in a still-writable block, and commits are
//! rounded up to page boundaries so a protected page is never shared with
//! writable space (W^X holds at every instant).
//!
//! Requests past the per-engine cap fail with `JitError::Memory`; the
//! controller reacts by silently disabling compilation of new traces.

use crate::error::JitError;

/// Page granularity assumed for alignment
pub const MCODE_PAGE_SIZE: usize = 4096;
/// First block size
pub const MCODE_INITIAL_SIZE: usize = 64 * 1024;
/// Default per-engine cap
pub const MCODE_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Lifecycle state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Mapped but unused
    Free,
    /// Partially filled, cursor may still land here
    Used,
    /// Every committed byte is read+execute
    Protected,
}

#[derive(Debug)]
struct Block {
    base: *mut u8,
    size: usize,
    /// Bytes committed, page-aligned
    used: usize,
    /// Bytes flipped to read+execute from the block base
    protected_until: usize,
}

impl Block {
    fn state(&self) -> BlockState {
        if self.used == 0 {
            BlockState::Free
        } else if self.protected_until >= self.used {
            BlockState::Protected
        } else {
            BlockState::Used
        }
    }
}

/// Per-State executable-memory manager
pub struct JitMem {
    blocks: Vec<Block>,
    /// Index of the block the cursor lives in
    current: usize,
    total_size: usize,
    max_size: usize,
    pub alloc_count: u32,
    pub protect_count: u32,
}

#[inline]
fn page_align(n: usize) -> usize {
    (n + MCODE_PAGE_SIZE - 1) & !(MCODE_PAGE_SIZE - 1)
}

#[cfg(unix)]
mod os {
    use super::MCODE_PAGE_SIZE;

    pub fn map_rw(size: usize) -> Option<*mut u8> {
        debug_assert_eq!(size % MCODE_PAGE_SIZE, 0);
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            None
        } else {
            Some(addr as *mut u8)
        }
    }

    pub fn unmap(addr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, size);
        }
    }

    pub fn protect(addr: *mut u8, size: usize, exec: bool) -> bool {
        let prot = if exec {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot) == 0 }
    }
}

#[cfg(not(unix))]
mod os {
    // Windows support would go through VirtualAlloc/VirtualProtect; the
    // workspace pins no windows dependency, so mapping fails cleanly and
    // the JIT stays disabled.
    pub fn map_rw(_size: usize) -> Option<*mut u8> {
        None
    }
    pub fn unmap(_addr: *mut u8, _size: usize) {}
    pub fn protect(_addr: *mut u8, _size: usize, _exec: bool) -> bool {
        false
    }
}

impl JitMem {
    /// Create a manager with the given cap; blocks are mapped lazily
    pub fn new(max_size: usize) -> Self {
        JitMem {
            blocks: Vec::new(),
            current: 0,
            total_size: 0,
            max_size: if max_size == 0 { MCODE_MAX_SIZE } else { max_size },
            alloc_count: 0,
            protect_count: 0,
        }
    }

    /// Total bytes mapped from the OS
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Reserve at least `min_bytes` of writable space, growing the block
    /// list if the current block has no room. Returns the cursor address
    /// and the available length.
    pub fn reserve(&mut self, min_bytes: usize) -> Result<(*mut u8, usize), JitError> {
        if let Some(block) = self.blocks.get(self.current) {
            let avail = block.size - block.used;
            if avail >= min_bytes && block.state() != BlockState::Protected {
                let addr = unsafe { block.base.add(block.used) };
                return Ok((addr, avail));
            }
        }

        // need a fresh block
        let size = page_align(min_bytes.max(MCODE_INITIAL_SIZE));
        if self.total_size + size > self.max_size {
            return Err(JitError::Memory);
        }
        let base = os::map_rw(size).ok_or(JitError::Memory)?;
        self.alloc_count += 1;
        self.total_size += size;
        self.blocks.push(Block {
            base,
            size,
            used: 0,
            protected_until: 0,
        });
        self.current = self.blocks.len() - 1;
        let block = &self.blocks[self.current];
        Ok((block.base, block.size))
    }

    /// Commit `used_bytes` at the cursor. The commit is rounded up to a
    /// page so later protection never touches writable space.
    pub fn commit(&mut self, used_bytes: usize) {
        if let Some(block) = self.blocks.get_mut(self.current) {
            block.used = (block.used + page_align(used_bytes)).min(block.size);
        }
    }

    /// Flip `[addr, addr+size)` to read+execute
    pub fn protect_exec(&mut self, addr: *mut u8, size: usize) -> Result<(), JitError> {
        let aligned = page_align(size);
        if !os::protect(addr, aligned, true) {
            return Err(JitError::Memory);
        }
        self.protect_count += 1;
        if let Some(block) = self.block_of_mut(addr) {
            let offset = addr as usize - block.base as usize;
            block.protected_until = block.protected_until.max(offset + aligned);
        }
        Ok(())
    }

    /// Flip `[addr, addr+size)` back to read+write (used by flush)
    pub fn protect_write(&mut self, addr: *mut u8, size: usize) -> Result<(), JitError> {
        if !os::protect(addr, page_align(size), false) {
            return Err(JitError::Memory);
        }
        if let Some(block) = self.block_of_mut(addr) {
            let offset = addr as usize - block.base as usize;
            block.protected_until = block.protected_until.min(offset);
        }
        Ok(())
    }

    /// Instruction-cache maintenance after new code is made executable.
    /// x86 keeps caches coherent; a compiler fence is enough. AArch64
    /// needs data-cache clean plus instruction-cache invalidate with
    /// barriers.
    pub fn flush_icache(addr: *const u8, size: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            let _ = (addr, size);
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            const LINE: usize = 64;
            let start = addr as usize & !(LINE - 1);
            let end = addr as usize + size;
            let mut p = start;
            while p < end {
                std::arch::asm!("dc cvau, {0}", in(reg) p);
                p += LINE;
            }
            std::arch::asm!("dsb ish");
            let mut p = start;
            while p < end {
                std::arch::asm!("ic ivau, {0}", in(reg) p);
                p += LINE;
            }
            std::arch::asm!("dsb ish", "isb");
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = (addr, size);
        }
    }

    /// State of the block containing `addr`, for invariant checks
    pub fn state_of(&self, addr: *const u8) -> Option<BlockState> {
        self.blocks
            .iter()
            .find(|b| {
                let base = b.base as usize;
                (base..base + b.size).contains(&(addr as usize))
            })
            .map(|b| b.state())
    }

    fn block_of_mut(&mut self, addr: *mut u8) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| {
            let base = b.base as usize;
            (base..base + b.size).contains(&(addr as usize))
        })
    }

    /// Release every block except the first, which is recycled writable.
    /// Used by `jit.flush()`.
    pub fn reset(&mut self) {
        for block in self.blocks.drain(1..) {
            self.total_size -= block.size;
            os::unmap(block.base, block.size);
        }
        if let Some(first) = self.blocks.first_mut() {
            os::protect(first.base, first.size, false);
            first.used = 0;
            first.protected_until = 0;
        }
        self.current = 0;
    }
}

impl Drop for JitMem {
    fn drop(&mut self) {
        for block in &self.blocks {
            os::unmap(block.base, block.size);
        }
    }
}

// The raw block pointers never leave the owning State's thread.
unsafe impl Send for JitMem {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_protect_cycle() {
        let mut mem = JitMem::new(MCODE_MAX_SIZE);
        let (addr, avail) = mem.reserve(128).unwrap();
        assert!(avail >= 128);
        assert_eq!(mem.state_of(addr), Some(BlockState::Free));

        // write some bytes while the page is RW
        unsafe {
            addr.write(0xC3);
        }
        mem.commit(128);
        assert_eq!(mem.state_of(addr), Some(BlockState::Used));

        mem.protect_exec(addr, 128).unwrap();
        assert_eq!(mem.state_of(addr), Some(BlockState::Protected));
        JitMem::flush_icache(addr, 128);
    }

    #[test]
    fn test_cap_is_enforced() {
        // cap allows exactly one initial block
        let mut mem = JitMem::new(MCODE_INITIAL_SIZE);
        let (_, avail) = mem.reserve(16).unwrap();
        assert_eq!(avail, MCODE_INITIAL_SIZE);
        mem.commit(MCODE_INITIAL_SIZE);
        // a second block would exceed the cap
        assert_eq!(mem.reserve(16).unwrap_err(), JitError::Memory);
    }

    #[test]
    fn test_commit_page_aligns() {
        let mut mem = JitMem::new(MCODE_MAX_SIZE);
        let (addr, _) = mem.reserve(64).unwrap();
        mem.commit(1);
        // the next reservation starts on a fresh page, never sharing with
        // soon-to-be-protected code
        let (next, _) = mem.reserve(64).unwrap();
        assert_eq!((next as usize) % MCODE_PAGE_SIZE, 0);
        assert_eq!(next as usize - addr as usize, MCODE_PAGE_SIZE);
    }

    #[test]
    fn test_reset_keeps_first_block() {
        let mut mem = JitMem::new(MCODE_MAX_SIZE);
        let (a1, _) = mem.reserve(64).unwrap();
        mem.commit(MCODE_INITIAL_SIZE); // fill the first block
        let (_a2, _) = mem.reserve(64).unwrap();
        assert!(mem.total_size() > MCODE_INITIAL_SIZE);

        mem.reset();
        assert_eq!(mem.total_size(), MCODE_INITIAL_SIZE);
        // the first block is writable again
        let (a3, _) = mem.reserve(64).unwrap();
        assert_eq!(a1, a3);
    }
}
