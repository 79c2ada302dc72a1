//! A persistent word-occurrence index.
//!
//! The index is an AVL tree keyed by NUL-terminated byte strings. All of it
//! (the nodes, the key strings and the anchor block holding the root pointer
//! and the counters) is allocated out of an [`scm`] region.
//! Since the region is always mapped at the same address, the raw pointers
//! linking the tree together stay valid across process restarts: reopening
//! the backing file *is* the load step.

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

use std::cmp::{Ordering, max};
use std::error::Error;
use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use std::str;

use scm::{Scm, ScmError};

// Stored verbatim inside the region; the layout must not change between
// runs that share a backing file.
#[repr(C)]
struct Node {
    item: *const u8,
    count: u64,
    depth: i32,
    left: *mut Node,
    right: *mut Node,
}

// The anchor. Always the first allocation of a fresh region, which is what
// lets a reopen find it at `Scm::mbase()`.
#[repr(C)]
struct State {
    items: u64,
    unique: u64,
    root: *mut Node,
}

#[derive(Debug)]
pub enum IndexError {
    Scm( ScmError ),
    EmptyKey,
    KeyContainsNul,
    NotFound,
}

impl fmt::Display for IndexError {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> fmt::Result {
        match *self {
            IndexError::Scm( ref error ) => write!( fmt, "{}", error ),
            IndexError::EmptyKey => write!( fmt, "empty keys cannot be indexed" ),
            IndexError::KeyContainsNul => write!( fmt, "keys cannot contain NUL bytes" ),
            IndexError::NotFound => write!( fmt, "no such key in the index" ),
        }
    }
}

impl Error for IndexError {}

impl From< ScmError > for IndexError {
    fn from( error: ScmError ) -> Self {
        IndexError::Scm( error )
    }
}

fn validate_key( key: &str ) -> Result< &[u8], IndexError > {
    if key.is_empty() {
        return Err( IndexError::EmptyKey );
    }
    if key.as_bytes().contains( &0 ) {
        return Err( IndexError::KeyContainsNul );
    }

    Ok( key.as_bytes() )
}

// strcmp semantics: strict byte order, ties broken by length through the
// implicit terminator.
fn compare( key: &[u8], item: *const u8 ) -> Ordering {
    let existing = unsafe { CStr::from_ptr( item as *const c_char ) };
    key.cmp( existing.to_bytes() )
}

fn depth_of( node: *const Node ) -> i32 {
    if node.is_null() {
        -1
    } else {
        unsafe { (*node).depth }
    }
}

fn combined_depth( left: *const Node, right: *const Node ) -> i32 {
    max( depth_of( left ), depth_of( right ) ) + 1
}

unsafe fn balance_of( node: *const Node ) -> i32 {
    depth_of( (*node).left ) - depth_of( (*node).right )
}

unsafe fn rotate_right( node: *mut Node ) -> *mut Node {
    let root = (*node).left;
    (*node).left = (*root).right;
    (*root).right = node;
    (*node).depth = combined_depth( (*node).left, (*node).right );
    (*root).depth = combined_depth( (*root).left, node );
    root
}

unsafe fn rotate_left( node: *mut Node ) -> *mut Node {
    let root = (*node).right;
    (*node).right = (*root).left;
    (*root).left = node;
    (*node).depth = combined_depth( (*node).left, (*node).right );
    (*root).depth = combined_depth( node, (*root).right );
    root
}

unsafe fn rotate_left_right( node: *mut Node ) -> *mut Node {
    (*node).left = rotate_left( (*node).left );
    rotate_right( node )
}

unsafe fn rotate_right_left( node: *mut Node ) -> *mut Node {
    (*node).right = rotate_right( (*node).right );
    rotate_left( node )
}

// One rotation per unbalanced node: the side comes from the balance sign,
// single vs. double from where the freshly inserted key landed relative to
// the taller child.
unsafe fn rebalance_after_insert( mut node: *mut Node, key: &[u8] ) -> *mut Node {
    let balance = balance_of( node );
    if balance > 1 {
        node = if compare( key, (*(*node).left).item ) == Ordering::Less {
            rotate_right( node )
        } else {
            rotate_left_right( node )
        };
    } else if balance < -1 {
        node = if compare( key, (*(*node).right).item ) == Ordering::Greater {
            rotate_left( node )
        } else {
            rotate_right_left( node )
        };
    }

    node
}

// After a removal the offending key may be gone, so the inner child's
// balance sign picks single vs. double instead.
unsafe fn rebalance_after_remove( mut node: *mut Node ) -> *mut Node {
    let balance = balance_of( node );
    if balance > 1 {
        node = if balance_of( (*node).left ) >= 0 {
            rotate_right( node )
        } else {
            rotate_left_right( node )
        };
    } else if balance < -1 {
        node = if balance_of( (*node).right ) <= 0 {
            rotate_left( node )
        } else {
            rotate_right_left( node )
        };
    }

    node
}

unsafe fn visit< F: FnMut( &str, u64 ) >( node: *const Node, callback: &mut F ) {
    if node.is_null() {
        return;
    }

    visit( (*node).left, callback );

    let key = CStr::from_ptr( (*node).item as *const c_char ).to_bytes();
    // Keys only ever enter through `insert( &str )`.
    callback( str::from_utf8_unchecked( key ), (*node).count );

    visit( (*node).right, callback );
}

/// A word index living inside an SCM region.
pub struct WordIndex {
    state: *mut State,
    scm: Scm,
}

impl WordIndex {
    /// Opens (or, with `truncate`, resets) the index stored in the region
    /// backed by `path`.
    pub fn open< P: AsRef< Path > >( path: P, truncate: bool ) -> Result< Self, IndexError > {
        let mut scm = Scm::open( path, truncate )?;

        let state = if scm.utilized() > 0 {
            debug!( "Adopting an existing index out of {} utilized bytes", scm.utilized() );
            scm.mbase() as *mut State
        } else {
            let state = scm.alloc( mem::size_of::< State >() )? as *mut State;
            debug_assert_eq!( state as *mut u8, scm.mbase() );
            unsafe {
                ptr::write( state, State {
                    items: 0,
                    unique: 0,
                    root: ptr::null_mut(),
                });
            }
            state
        };

        Ok( WordIndex { state, scm } )
    }

    /// Adds one occurrence of `key`.
    ///
    /// A novel key allocates a node and a key copy out of the region; a
    /// repeated key only bumps its counter. If the region runs out of space
    /// the tree keeps its previous shape.
    pub fn insert( &mut self, key: &str ) -> Result< (), IndexError > {
        let key = validate_key( key )?;
        let root = unsafe { (*self.state).root };
        let root = self.update( root, key )?;
        unsafe {
            (*self.state).root = root;
        }

        Ok(())
    }

    /// How many times `key` has been inserted; 0 if never.
    pub fn count( &self, key: &str ) -> u64 {
        self.lookup( key.as_bytes() )
    }

    /// Removes `key` entirely, regardless of its current count.
    pub fn remove( &mut self, key: &str ) -> Result< (), IndexError > {
        let key = validate_key( key )?;

        let count = self.lookup( key );
        if count == 0 {
            return Err( IndexError::NotFound );
        }

        unsafe {
            let root = (*self.state).root;
            (*self.state).root = self.remove_node( root, key );
            (*self.state).items -= count;
            (*self.state).unique -= 1;
        }

        Ok(())
    }

    /// Calls `callback( key, count )` for every word, in strictly ascending
    /// byte order. The callback must not mutate the index.
    pub fn for_each< F: FnMut( &str, u64 ) >( &self, mut callback: F ) {
        unsafe {
            visit( (*self.state).root, &mut callback );
        }
    }

    /// Total insertions, i.e. the sum of every count.
    pub fn items( &self ) -> u64 {
        unsafe { (*self.state).items }
    }

    /// Number of distinct words.
    pub fn unique( &self ) -> u64 {
        unsafe { (*self.state).unique }
    }

    /// Region bytes consumed so far.
    pub fn space_utilized( &self ) -> usize {
        self.scm.utilized()
    }

    /// Region bytes still available.
    pub fn space_capacity( &self ) -> usize {
        self.scm.capacity()
    }

    /// Syncs the region to its backing file and releases the handle.
    pub fn close( self ) -> Result< (), IndexError > {
        self.scm.close().map_err( IndexError::Scm )
    }

    fn lookup( &self, key: &[u8] ) -> u64 {
        let mut node = unsafe { (*self.state).root } as *const Node;
        while !node.is_null() {
            unsafe {
                match compare( key, (*node).item ) {
                    Ordering::Equal => return (*node).count,
                    Ordering::Less => node = (*node).left,
                    Ordering::Greater => node = (*node).right,
                }
            }
        }

        0
    }

    fn new_node( &mut self, key: &[u8] ) -> Result< *mut Node, IndexError > {
        // Both allocations happen before the caller links the node in, so
        // running out of space mid-insert cannot leave a dangling child.
        let node = self.scm.alloc( mem::size_of::< Node >() )? as *mut Node;
        let item = self.scm.strdup( key )?;

        unsafe {
            ptr::write( node, Node {
                item,
                count: 1,
                depth: 0,
                left: ptr::null_mut(),
                right: ptr::null_mut(),
            });

            (*self.state).items += 1;
            (*self.state).unique += 1;
        }

        Ok( node )
    }

    fn update( &mut self, node: *mut Node, key: &[u8] ) -> Result< *mut Node, IndexError > {
        if node.is_null() {
            return self.new_node( key );
        }

        unsafe {
            match compare( key, (*node).item ) {
                Ordering::Equal => {
                    (*node).count += 1;
                    (*self.state).items += 1;
                    return Ok( node );
                },
                Ordering::Less => {
                    (*node).left = self.update( (*node).left, key )?;
                },
                Ordering::Greater => {
                    (*node).right = self.update( (*node).right, key )?;
                },
            }

            (*node).depth = combined_depth( (*node).left, (*node).right );
            Ok( rebalance_after_insert( node, key ) )
        }
    }

    // The key is known to be present; returns the new subtree root.
    unsafe fn remove_node( &mut self, node: *mut Node, key: &[u8] ) -> *mut Node {
        match compare( key, (*node).item ) {
            Ordering::Less => {
                (*node).left = self.remove_node( (*node).left, key );
            },
            Ordering::Greater => {
                (*node).right = self.remove_node( (*node).right, key );
            },
            Ordering::Equal => {
                if (*node).left.is_null() || (*node).right.is_null() {
                    let replacement = if (*node).left.is_null() {
                        (*node).right
                    } else {
                        (*node).left
                    };

                    self.scm.free( (*node).item as *mut u8 );
                    self.scm.free( node as *mut u8 );

                    return replacement;
                }

                let mut successor = (*node).right;
                while !(*successor).left.is_null() {
                    successor = (*successor).left;
                }

                // Aliasing the successor's key instead of copying it is fine
                // since freed region space is never handed out again.
                (*node).item = (*successor).item;
                (*node).count = (*successor).count;

                let successor_key = CStr::from_ptr( (*node).item as *const c_char )
                    .to_bytes()
                    .to_vec();
                (*node).right = self.remove_node( (*node).right, &successor_key );
            },
        }

        (*node).depth = combined_depth( (*node).left, (*node).right );
        rebalance_after_remove( node )
    }
}
