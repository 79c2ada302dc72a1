//! A file-backed memory region mapped at a fixed virtual address.
//!
//! Pointers into the region are durable: the backing file is always mapped
//! at the same address, so a pointer written into the region in one run
//! dereferences to the same bytes in the next. Allocation is a forward-only
//! bump; `free` never reclaims and the high-water mark lives in the first
//! eight bytes of the region itself, which is how a reopened region knows
//! where its previous run stopped.

#[macro_use]
extern crate log;

use std::error::Error;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

/// Every region is mapped here. Stored pointers are only meaningful while
/// the placement never changes.
pub const REGION_ADDRESS: usize = 0x6000_0000_0000;

/// Persisted `utilized` counter plus one reserved alignment slot.
pub const HEADER_SIZE: usize = 16;

/// Every block carries its payload length just before the payload.
pub const BLOCK_PREFIX_SIZE: usize = 8;

const ALIGNMENT: usize = 8;

// Without MAP_FIXED_NOREPLACE the address is only a hint; `open` verifies
// the returned address either way. MAP_FIXED itself is not an option since
// it would silently clobber whatever was already mapped there.
#[cfg(target_os = "linux")]
const MAP_PLACEMENT: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_PLACEMENT: libc::c_int = 0;

#[derive(Debug)]
pub enum ScmError {
    Open( io::Error ),
    NotRegularFile,
    TooSmall { size: usize },
    MapFailed( io::Error ),
    MapDisplaced { address: usize },
    CorruptHeader { utilized: usize, arena: usize },
    ZeroSizedAllocation,
    OutOfSpace { requested: usize, remaining: usize },
    Sync( io::Error ),
}

impl fmt::Display for ScmError {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> fmt::Result {
        match *self {
            ScmError::Open( ref error ) => {
                write!( fmt, "cannot open the backing file: {}", error )
            },
            ScmError::NotRegularFile => {
                write!( fmt, "the backing file is not a regular file" )
            },
            ScmError::TooSmall { size } => {
                write!( fmt, "the backing file is only {} bytes long; too small to hold a region", size )
            },
            ScmError::MapFailed( ref error ) => {
                write!( fmt, "cannot map the backing file: {}", error )
            },
            ScmError::MapDisplaced { address } => {
                write!( fmt, "the kernel mapped the region at 0x{:x} instead of the fixed address 0x{:x}", address, REGION_ADDRESS )
            },
            ScmError::CorruptHeader { utilized, arena } => {
                write!( fmt, "corrupted region header: {} bytes marked as utilized in an arena of {} bytes", utilized, arena )
            },
            ScmError::ZeroSizedAllocation => {
                write!( fmt, "zero sized allocation" )
            },
            ScmError::OutOfSpace { requested, remaining } => {
                write!( fmt, "out of region space: {} bytes requested, {} bytes remaining", requested, remaining )
            },
            ScmError::Sync( ref error ) => {
                write!( fmt, "cannot sync the region: {}", error )
            },
        }
    }
}

impl Error for ScmError {}

/// A handle to an open region.
///
/// The handle owns the mapping and the file descriptor; dropping it unmaps
/// the region without syncing, [`Scm::close`] syncs first. It is deliberately
/// neither `Send` nor `Sync` and a process can hold at most one at a time,
/// since all regions contend for the same fixed address.
pub struct Scm {
    // Keeps the descriptor alive for as long as the mapping.
    _file: std::fs::File,
    base: *mut u8,
    size: usize,
    utilized: usize,
}

fn align_up( size: usize ) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

impl Scm {
    /// Opens the regular file at `path` and maps it at the fixed address.
    ///
    /// With `truncate` the region is reset to empty; otherwise the previous
    /// run's high-water mark is adopted from the region header. The file's
    /// length becomes the region size and is never changed.
    pub fn open< P: AsRef< Path > >( path: P, truncate: bool ) -> Result< Self, ScmError > {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read( true )
            .write( true )
            .open( path )
            .map_err( ScmError::Open )?;

        let metadata = file.metadata().map_err( ScmError::Open )?;
        if !metadata.file_type().is_file() {
            return Err( ScmError::NotRegularFile );
        }

        let size = metadata.len() as usize;
        if size < HEADER_SIZE + BLOCK_PREFIX_SIZE {
            return Err( ScmError::TooSmall { size } );
        }

        let base = unsafe {
            libc::mmap(
                REGION_ADDRESS as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | MAP_PLACEMENT,
                file.as_raw_fd(),
                0
            )
        };

        if base == libc::MAP_FAILED {
            return Err( ScmError::MapFailed( io::Error::last_os_error() ) );
        }

        if base as usize != REGION_ADDRESS {
            unsafe {
                libc::munmap( base, size );
            }
            return Err( ScmError::MapDisplaced { address: base as usize } );
        }

        // From here on dropping `scm` unmaps, so every error path below
        // releases the mapping and the descriptor.
        let mut scm = Scm {
            _file: file,
            base: base as *mut u8,
            size,
            utilized: 0,
        };

        if truncate {
            scm.write_header( 0 );
        } else {
            let utilized = unsafe { *(scm.base as *const u64) } as usize;
            if utilized > scm.arena_size() {
                return Err( ScmError::CorruptHeader { utilized, arena: scm.arena_size() } );
            }
            scm.utilized = utilized;
        }

        debug!( "Mapped {:?}: {} bytes at 0x{:x}, {} utilized", path, size, REGION_ADDRESS, scm.utilized );
        Ok( scm )
    }

    /// Allocates `size` bytes out of the region.
    ///
    /// The request is rounded up to an 8 byte multiple so that every payload
    /// is aligned enough to hold pointers; the rounded length is what the
    /// block prefix records. On failure nothing is mutated.
    pub fn alloc( &mut self, size: usize ) -> Result< *mut u8, ScmError > {
        if size == 0 {
            return Err( ScmError::ZeroSizedAllocation );
        }

        let size = align_up( size );
        let remaining = self.capacity();
        if size + BLOCK_PREFIX_SIZE > remaining {
            return Err( ScmError::OutOfSpace { requested: size, remaining } );
        }

        unsafe {
            let prefix = self.base.add( HEADER_SIZE + self.utilized ) as *mut u64;
            *prefix = size as u64;

            let payload = (prefix as *mut u8).add( BLOCK_PREFIX_SIZE );
            self.write_header( self.utilized + BLOCK_PREFIX_SIZE + size );

            Ok( payload )
        }
    }

    /// Copies `bytes` plus a NUL terminator into a fresh allocation.
    ///
    /// The bytes must not themselves contain a NUL; the terminator is the
    /// only length marker a stored string has.
    pub fn strdup( &mut self, bytes: &[u8] ) -> Result< *const u8, ScmError > {
        debug_assert!( !bytes.contains( &0 ) );

        let pointer = self.alloc( bytes.len() + 1 )?;
        unsafe {
            ptr::copy_nonoverlapping( bytes.as_ptr(), pointer, bytes.len() );
            *pointer.add( bytes.len() ) = 0;
        }

        Ok( pointer as *const u8 )
    }

    /// Logically frees an allocation. Space is never actually reclaimed;
    /// the block's size prefix stays in place for an allocator that does.
    pub fn free( &mut self, _pointer: *mut u8 ) {}

    /// Arena bytes consumed so far, size prefixes included.
    pub fn utilized( &self ) -> usize {
        self.utilized
    }

    /// Arena bytes still allocatable.
    pub fn capacity( &self ) -> usize {
        self.arena_size() - self.utilized
    }

    /// The address the first allocation after a truncating open returned.
    ///
    /// A data structure that makes its anchor block the first allocation can
    /// find it again here on reopen without persisting any extra offset.
    pub fn mbase( &self ) -> *mut u8 {
        unsafe { self.base.add( HEADER_SIZE + BLOCK_PREFIX_SIZE ) }
    }

    /// Syncs the whole region to the backing file and releases the handle.
    pub fn close( self ) -> Result< (), ScmError > {
        debug!( "Syncing {} bytes to the backing file", self.size );

        let result = unsafe {
            libc::msync( self.base as *mut libc::c_void, self.size, libc::MS_SYNC )
        };

        if result != 0 {
            return Err( ScmError::Sync( io::Error::last_os_error() ) );
        }

        Ok(())
    }

    fn arena_size( &self ) -> usize {
        self.size - HEADER_SIZE
    }

    fn write_header( &mut self, utilized: usize ) {
        self.utilized = utilized;
        unsafe {
            *(self.base as *mut u64) = utilized as u64;
        }
    }
}

impl Drop for Scm {
    fn drop( &mut self ) {
        unsafe {
            if libc::munmap( self.base as *mut libc::c_void, self.size ) != 0 {
                warn!( "munmap failed: {}", io::Error::last_os_error() );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::CStr;
    use std::fs;
    use std::path::PathBuf;

    use lazy_static::lazy_static;
    use parking_lot::Mutex;

    // Every test maps at the same fixed address, so they cannot overlap.
    lazy_static! {
        static ref REGION_LOCK: Mutex< () > = Mutex::new( () );
    }

    struct ScratchFile {
        path: PathBuf,
    }

    impl ScratchFile {
        fn new( name: &str, size: u64 ) -> Self {
            let path = std::env::temp_dir().join( format!( "scm-{}-{}.region", std::process::id(), name ) );
            let fp = fs::File::create( &path ).unwrap();
            fp.set_len( size ).unwrap();
            ScratchFile { path }
        }
    }

    impl Drop for ScratchFile {
        fn drop( &mut self ) {
            let _ = fs::remove_file( &self.path );
        }
    }

    #[test]
    fn open_fails_on_a_missing_file() {
        let _guard = REGION_LOCK.lock();
        let path = std::env::temp_dir().join( format!( "scm-{}-no-such-file.region", std::process::id() ) );
        assert!( matches!( Scm::open( &path, true ), Err( ScmError::Open( _ ) ) ) );
    }

    #[test]
    fn open_fails_on_a_file_too_small_for_the_header() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "tiny", 8 );
        assert!( matches!( Scm::open( &file.path, true ), Err( ScmError::TooSmall { .. } ) ) );
    }

    #[test]
    fn a_second_mapping_cannot_be_opened_while_one_is_live() {
        let _guard = REGION_LOCK.lock();
        let file_a = ScratchFile::new( "first", 4096 );
        let file_b = ScratchFile::new( "second", 4096 );

        let scm = Scm::open( &file_a.path, true ).unwrap();
        assert!( Scm::open( &file_b.path, true ).is_err() );
        drop( scm );

        let scm = Scm::open( &file_b.path, true ).unwrap();
        drop( scm );
    }

    #[test]
    fn truncate_resets_the_region() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "truncate", 4096 );

        {
            let mut scm = Scm::open( &file.path, true ).unwrap();
            scm.alloc( 100 ).unwrap();
            assert_ne!( scm.utilized(), 0 );
            scm.close().unwrap();
        }

        let scm = Scm::open( &file.path, true ).unwrap();
        assert_eq!( scm.utilized(), 0 );
        assert_eq!( scm.capacity(), 4096 - HEADER_SIZE );
    }

    #[test]
    fn allocations_are_sequential_and_prefixed() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "sequential", 4096 );
        let mut scm = Scm::open( &file.path, true ).unwrap();

        let first = scm.alloc( 16 ).unwrap();
        assert_eq!( first as usize, REGION_ADDRESS + HEADER_SIZE + BLOCK_PREFIX_SIZE );
        assert_eq!( first, scm.mbase() );
        assert_eq!( scm.utilized(), 16 + BLOCK_PREFIX_SIZE );

        let second = scm.alloc( 8 ).unwrap();
        assert_eq!( second as usize, first as usize + 16 + BLOCK_PREFIX_SIZE );

        unsafe {
            assert_eq!( *(first.sub( 8 ) as *const u64), 16 );
            assert_eq!( *(second.sub( 8 ) as *const u64), 8 );
        }
    }

    #[test]
    fn requests_are_rounded_up_for_alignment() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "alignment", 4096 );
        let mut scm = Scm::open( &file.path, true ).unwrap();

        scm.alloc( 5 ).unwrap();
        assert_eq!( scm.utilized(), 8 + BLOCK_PREFIX_SIZE );

        let next = scm.alloc( 24 ).unwrap();
        assert_eq!( next as usize % 8, 0 );
    }

    #[test]
    fn zero_sized_allocations_are_rejected() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "zero", 4096 );
        let mut scm = Scm::open( &file.path, true ).unwrap();
        assert!( matches!( scm.alloc( 0 ), Err( ScmError::ZeroSizedAllocation ) ) );
        assert_eq!( scm.utilized(), 0 );
    }

    #[test]
    fn an_oversized_request_leaves_the_region_unchanged() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "oversized", 4096 );
        let mut scm = Scm::open( &file.path, true ).unwrap();

        scm.alloc( 64 ).unwrap();
        let utilized = scm.utilized();

        assert!( matches!( scm.alloc( 8192 ), Err( ScmError::OutOfSpace { .. } ) ) );
        assert_eq!( scm.utilized(), utilized );

        // The last byte of the arena is still allocatable...
        let remaining = scm.capacity() - BLOCK_PREFIX_SIZE;
        scm.alloc( remaining ).unwrap();
        assert_eq!( scm.capacity(), 0 );

        // ...and after that nothing is.
        assert!( scm.alloc( 1 ).is_err() );
    }

    #[test]
    fn strdup_copies_the_bytes_and_the_terminator() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "strdup", 4096 );
        let mut scm = Scm::open( &file.path, true ).unwrap();

        let pointer = scm.strdup( b"hello" ).unwrap();
        let copied = unsafe { CStr::from_ptr( pointer as *const libc::c_char ) };
        assert_eq!( copied.to_bytes(), b"hello" );
    }

    #[test]
    fn free_reclaims_nothing() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "free", 4096 );
        let mut scm = Scm::open( &file.path, true ).unwrap();

        let pointer = scm.alloc( 32 ).unwrap();
        let utilized = scm.utilized();
        scm.free( pointer );
        assert_eq!( scm.utilized(), utilized );
    }

    #[test]
    fn the_high_water_mark_survives_a_reopen() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "reopen", 4096 );

        let utilized = {
            let mut scm = Scm::open( &file.path, true ).unwrap();
            scm.alloc( 40 ).unwrap();
            scm.alloc( 16 ).unwrap();
            let utilized = scm.utilized();
            scm.close().unwrap();
            utilized
        };

        let mut scm = Scm::open( &file.path, false ).unwrap();
        assert_eq!( scm.utilized(), utilized );

        // New allocations continue where the previous run stopped.
        let next = scm.alloc( 8 ).unwrap();
        assert_eq!( next as usize, REGION_ADDRESS + HEADER_SIZE + utilized + BLOCK_PREFIX_SIZE );
    }

    #[test]
    fn stored_bytes_survive_a_reopen_at_the_same_address() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "contents", 4096 );

        let pointer = {
            let mut scm = Scm::open( &file.path, true ).unwrap();
            let pointer = scm.strdup( b"durable" ).unwrap();
            scm.close().unwrap();
            pointer
        };

        let scm = Scm::open( &file.path, false ).unwrap();
        let copied = unsafe { CStr::from_ptr( pointer as *const libc::c_char ) };
        assert_eq!( copied.to_bytes(), b"durable" );
        drop( scm );
    }

    #[test]
    fn a_corrupted_header_is_rejected() {
        let _guard = REGION_LOCK.lock();
        let file = ScratchFile::new( "corrupted", 4096 );

        {
            let scm = Scm::open( &file.path, true ).unwrap();
            unsafe {
                *(REGION_ADDRESS as *mut u64) = 1_000_000;
            }
            let _ = scm.close();
        }

        assert!( matches!( Scm::open( &file.path, false ), Err( ScmError::CorruptHeader { .. } ) ) );
    }
}
