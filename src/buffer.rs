//! Bounded, tracked byte buffers with typed sub-views.
//!
//! A [`Buffer<T>`] is a pointer/size pair interpreted as a run of `T` elements. It comes
//! in two flavours: *owned* buffers allocate their backing bytes and free them on drop,
//! *borrowed* buffers view memory owned elsewhere — usually a sub-view of another buffer.
//!
//! Because a borrowed buffer is just a pointer into someone else's allocation, every
//! buffer is registered with a process-wide [`BufferTracker`] keyed by its
//! `(address, length)` pair. Sub-views record a parent/child relationship, and any
//! operation that frees or moves an owned buffer's allocation invalidates the whole
//! subtree below it. A stale view then reports [`Error::DanglingView`] on its next
//! access instead of dereferencing freed memory. For the same reason element access
//! always *copies* — handing out a reference into a region that can be invalidated at
//! runtime would defeat the point of the tracking.
//!
//! ## Alignment
//!
//! Converting between element types is only allowed when the two sizes divide one
//! another: an 8-byte type can view a buffer of 1-byte elements because `8 % 1 == 0`,
//! but a 6-byte structure cannot view a buffer of 4-byte elements because `6 % 4 != 0`.
//! Buffers flagged *variadic* treat their entire byte length as a single element and
//! align with everything; they exist for variable-length PE structures whose size comes
//! from a header field rather than from the type.

use std::alloc::{self, Layout};
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::marker::PhantomData;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::trace;

use crate::Error;

/// Marker for plain-old-data types which may be reinterpreted from raw image bytes.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern and contain no padding, pointers
/// or non-trivial drop glue. All PE wire structures satisfy this.
pub unsafe trait Castable: Copy + 'static {}

unsafe impl Castable for u8 {}
unsafe impl Castable for i8 {}
unsafe impl Castable for u16 {}
unsafe impl Castable for i16 {}
unsafe impl Castable for u32 {}
unsafe impl Castable for i32 {}
unsafe impl Castable for u64 {}
unsafe impl Castable for i64 {}

/// The `(address, byte length)` pair a buffer registers with the tracker.
pub type BufferKey = (usize, usize);

#[derive(Default)]
struct TrackerState {
    refcounts: BTreeMap<BufferKey, usize>,
    parents: BTreeMap<BufferKey, BufferKey>,
    children: BTreeMap<BufferKey, BTreeSet<BufferKey>>,
}

/// Process-wide registry of live buffer regions.
///
/// The tracker substitutes for compile-time lifetimes: it maps each region key to a
/// reference count and records which regions were carved out of which. All state sits
/// behind a single mutex; the lock is never held across a recursive step, so an
/// invalidation sweep over a deep view tree interleaves safely with other operations.
pub struct BufferTracker {
    state: Mutex<TrackerState>,
}

static TRACKER: Lazy<BufferTracker> = Lazy::new(|| BufferTracker {
    state: Mutex::new(TrackerState::default()),
});

impl BufferTracker {
    /// Get the global tracker instance.
    pub fn global() -> &'static BufferTracker {
        &TRACKER
    }

    /// Check whether the given region is currently live.
    pub fn is_valid(&self, key: BufferKey) -> bool {
        let state = self.state.lock().unwrap();
        state.refcounts.get(&key).map_or(false, |count| *count > 0)
    }

    /// Take a reference on the given region and, transitively, on its parent chain.
    ///
    /// Returns the region's new reference count.
    pub fn ref_key(&self, key: BufferKey) -> usize {
        let (count, parent) = {
            let mut state = self.state.lock().unwrap();
            let count = state.refcounts.entry(key).or_insert(0);
            *count += 1;
            (*count, state.parents.get(&key).copied())
        };

        if let Some(parent) = parent {
            self.ref_key(parent);
        }

        count
    }

    /// Release a reference on the given region and its parent chain.
    ///
    /// When the count reaches zero the region is invalidated, taking any sub-views
    /// with it. Returns the remaining count.
    pub fn deref_key(&self, key: BufferKey) -> usize {
        let (count, parent) = {
            let mut state = self.state.lock().unwrap();
            let count = match state.refcounts.get_mut(&key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => return 0,
            };
            (count, state.parents.get(&key).copied())
        };

        if let Some(parent) = parent {
            self.deref_key(parent);
        }

        if count == 0 {
            self.invalidate_inner(key, true);
        }

        count
    }

    /// Record that `child` is a view carved out of `parent`.
    ///
    /// A view with the same key as its parent is an alias and needs no edge; its
    /// reference count carries the relationship.
    pub fn relationship(&self, parent: BufferKey, child: BufferKey) {
        if parent == child {
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.parents.insert(child, parent);
        state.children.entry(parent).or_default().insert(child);
    }

    /// Forcibly remove a region and every view carved from it.
    pub fn invalidate(&self, key: BufferKey) {
        self.invalidate_inner(key, false);
    }

    fn invalidate_inner(&self, key: BufferKey, derefed_parent: bool) {
        let (parent, children) = {
            let mut state = self.state.lock().unwrap();

            if state.refcounts.remove(&key).is_none() {
                return;
            }

            let parent = state.parents.remove(&key);

            if let Some(parent) = parent {
                if let Some(siblings) = state.children.get_mut(&parent) {
                    siblings.remove(&key);
                }
            }

            let children = state.children.remove(&key).unwrap_or_default();
            (parent, children)
        };

        trace!(
            address = key.0,
            size = key.1,
            children = children.len(),
            "invalidating buffer region"
        );

        if let Some(parent) = parent {
            if !derefed_parent {
                self.deref_key(parent);
            }
        }

        for child in children {
            self.invalidate_inner(child, false);
        }
    }
}

/// A typed region of image bytes.
///
/// See the [module documentation](self) for the ownership and tracking model. The unit
/// conventions are fixed: operations over the buffer's own element type (`get`, `read`,
/// `write`, `search`, `split_at`, ...) index in *elements*, while cross-typed operations
/// (`get_typed`, `subregion`, ...) take *byte* offsets. For a `Buffer<u8>` the two
/// coincide.
pub struct Buffer<T: Castable> {
    pointer: *mut u8,
    size: usize,
    allocated: bool,
    variadic: bool,
    _element: PhantomData<*mut T>,
}

impl<T: Castable> Buffer<T> {
    /// Create an empty, unallocated buffer.
    pub fn new() -> Self {
        Self {
            pointer: ptr::null_mut(),
            size: 0,
            allocated: false,
            variadic: false,
            _element: PhantomData,
        }
    }

    /// Allocate an owned, zero-filled buffer of `elements` elements.
    pub fn allocate(elements: usize) -> Result<Self, Error> {
        Self::allocate_bytes(elements.saturating_mul(mem::size_of::<T>()))
    }

    /// Allocate an owned buffer of `elements` elements, each set to `value`.
    pub fn allocate_filled(elements: usize, value: T) -> Result<Self, Error> {
        let mut buffer = Self::allocate(elements)?;

        for index in 0..buffer.elements() {
            buffer.set(index, value)?;
        }

        Ok(buffer)
    }

    /// Allocate an owned, zero-filled buffer of `size` bytes.
    ///
    /// The size must hold at least one element.
    pub fn allocate_bytes(size: usize) -> Result<Self, Error> {
        if size < mem::size_of::<T>() {
            return Err(Error::InsufficientAllocation {
                attempted: size,
                needed: mem::size_of::<T>(),
            });
        }

        let layout = Layout::from_size_align(size, 1).map_err(|_| Error::BadAllocation)?;
        let pointer = unsafe { alloc::alloc_zeroed(layout) };

        if pointer.is_null() {
            return Err(Error::BadAllocation);
        }

        let buffer = Self {
            pointer,
            size,
            allocated: true,
            variadic: false,
            _element: PhantomData,
        };

        BufferTracker::global().ref_key(buffer.key());

        Ok(buffer)
    }

    /// Allocate an owned buffer holding a copy of `data`.
    pub fn from_data(data: &[T]) -> Result<Self, Error> {
        let mut buffer = Self::allocate(data.len())?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Read a file into a new owned buffer.
    ///
    /// The file size must be a whole number of elements.
    pub fn from_file<P: AsRef<Path>>(filename: P) -> Result<Self, Error> {
        let path = filename.as_ref();
        let contents = fs::read(path).map_err(|source| Error::OpenFileFailure {
            path: path.to_path_buf(),
            source,
        })?;

        if mem::size_of::<T>() > 1 && contents.len() % mem::size_of::<T>() != 0 {
            return Err(Error::InsufficientData {
                offered: contents.len(),
                unit_size: 1,
                needed: mem::size_of::<T>(),
            });
        }

        let buffer = Self::allocate_bytes(contents.len())?;
        unsafe { ptr::copy_nonoverlapping(contents.as_ptr(), buffer.pointer, contents.len()) };

        Ok(buffer)
    }

    /// Borrow `elements` elements of memory owned elsewhere.
    ///
    /// # Safety
    ///
    /// The pointed-at memory must stay valid and unmoved for as long as this buffer or
    /// any view carved from it is used. The tracker catches views outliving *tracked*
    /// parents, not arbitrary foreign memory.
    pub unsafe fn from_ptr(pointer: *const T, elements: usize) -> Result<Self, Error> {
        Self::from_ptr_bytes(
            pointer as *const u8,
            elements.saturating_mul(mem::size_of::<T>()),
        )
    }

    /// Borrow `size` bytes of memory owned elsewhere.
    ///
    /// # Safety
    ///
    /// Same contract as [`Buffer::from_ptr`].
    pub unsafe fn from_ptr_bytes(pointer: *const u8, size: usize) -> Result<Self, Error> {
        if pointer.is_null() {
            return Err(Error::NullPointer);
        }

        let buffer = Self {
            pointer: pointer as *mut u8,
            size,
            allocated: false,
            variadic: false,
            _element: PhantomData,
        };

        BufferTracker::global().ref_key(buffer.key());

        Ok(buffer)
    }

    fn key(&self) -> BufferKey {
        (self.pointer as usize, self.size)
    }

    /// Get the validated base pointer of this buffer.
    ///
    /// Fails with [`Error::NullPointer`] on an empty buffer and with
    /// [`Error::DanglingView`] when the region was invalidated.
    pub fn as_ptr(&self) -> Result<*const u8, Error> {
        self.ptr().map(|pointer| pointer as *const u8)
    }

    fn ptr(&self) -> Result<*mut u8, Error> {
        if self.pointer.is_null() {
            return Err(Error::NullPointer);
        }

        if !BufferTracker::global().is_valid(self.key()) {
            return Err(Error::DanglingView {
                address: self.pointer as usize,
                size: self.size,
            });
        }

        Ok(self.pointer)
    }

    /// The size of this buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.size
    }

    /// The size of a single element: `size_of::<T>()`, or the whole byte length for
    /// variadic buffers.
    pub fn element_size(&self) -> usize {
        if self.variadic {
            self.size
        } else {
            mem::size_of::<T>()
        }
    }

    /// The number of whole elements in this buffer.
    pub fn elements(&self) -> usize {
        if self.variadic {
            usize::from(self.size > 0)
        } else {
            self.size / mem::size_of::<T>()
        }
    }

    /// Alias for [`Buffer::elements`].
    pub fn len(&self) -> usize {
        self.elements()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether this buffer owns (and will free) its allocation.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Whether this buffer treats its whole byte length as one element.
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Check whether this buffer's element size and `size` divide one another.
    ///
    /// Variadic buffers are byte-addressable and align with everything.
    pub fn aligns_with(&self, size: usize) -> bool {
        if self.variadic {
            return true;
        }

        let smaller = cmp::min(self.element_size(), size);
        let bigger = cmp::max(self.element_size(), size);

        smaller != 0 && bigger % smaller == 0
    }

    fn check_typed<U: Castable>(&self, offset: usize) -> Result<(), Error> {
        if !self.aligns_with(mem::size_of::<U>()) {
            return Err(Error::Alignment {
                left: self.element_size(),
                right: mem::size_of::<U>(),
            });
        }

        let stride = if self.variadic {
            1
        } else {
            cmp::min(mem::size_of::<T>(), mem::size_of::<U>())
        };

        if stride != 0 && offset % stride != 0 {
            return Err(Error::Alignment {
                left: self.element_size(),
                right: mem::size_of::<U>(),
            });
        }

        if offset + mem::size_of::<U>() > self.size {
            return Err(Error::OutOfBounds {
                offset: offset + mem::size_of::<U>(),
                size: self.size,
            });
        }

        Ok(())
    }

    /// Copy out the element at `index`.
    pub fn get(&self, index: usize) -> Result<T, Error> {
        if index >= self.elements() {
            return Err(Error::OutOfBounds {
                offset: index,
                size: self.elements(),
            });
        }

        if self.variadic && mem::size_of::<T>() > self.size {
            return Err(Error::OutOfBounds {
                offset: mem::size_of::<T>(),
                size: self.size,
            });
        }

        let pointer = self.ptr()?;

        unsafe {
            Ok(ptr::read_unaligned(
                pointer.add(index * mem::size_of::<T>()) as *const T
            ))
        }
    }

    /// Overwrite the element at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), Error> {
        if index >= self.elements() {
            return Err(Error::OutOfBounds {
                offset: index,
                size: self.elements(),
            });
        }

        if self.variadic && mem::size_of::<T>() > self.size {
            return Err(Error::OutOfBounds {
                offset: mem::size_of::<T>(),
                size: self.size,
            });
        }

        let pointer = self.ptr()?;

        unsafe {
            ptr::write_unaligned(pointer.add(index * mem::size_of::<T>()) as *mut T, value);
        }

        Ok(())
    }

    /// Copy out the first element.
    pub fn front(&self) -> Result<T, Error> {
        self.get(0)
    }

    /// Copy out the last element.
    pub fn back(&self) -> Result<T, Error> {
        if self.elements() == 0 {
            return Err(Error::OutOfBounds { offset: 0, size: 0 });
        }

        self.get(self.elements() - 1)
    }

    /// Copy out a value of a foreign type `U` at the given *byte* offset.
    ///
    /// The offset must be a multiple of the smaller of the two element sizes and the
    /// sizes must divide one another.
    pub fn get_typed<U: Castable>(&self, offset: usize) -> Result<U, Error> {
        self.check_typed::<U>(offset)?;
        let pointer = self.ptr()?;

        unsafe { Ok(ptr::read_unaligned(pointer.add(offset) as *const U)) }
    }

    /// Write a value of a foreign type `U` at the given *byte* offset.
    pub fn write_typed<U: Castable>(&mut self, offset: usize, value: U) -> Result<(), Error> {
        self.check_typed::<U>(offset)?;
        let pointer = self.ptr()?;

        unsafe {
            ptr::write_unaligned(pointer.add(offset) as *mut U, value);
        }

        Ok(())
    }

    /// Copy out `count` elements starting at element `index`.
    pub fn read(&self, index: usize, count: usize) -> Result<Vec<T>, Error> {
        let end = index.saturating_add(count);

        if end > self.elements() {
            return Err(Error::OutOfBounds {
                offset: end,
                size: self.elements(),
            });
        }

        let pointer = self.ptr()?;
        let mut result = Vec::with_capacity(count);

        for element in index..end {
            unsafe {
                result.push(ptr::read_unaligned(
                    pointer.add(element * mem::size_of::<T>()) as *const T,
                ));
            }
        }

        Ok(result)
    }

    /// Write the given elements starting at element `index`.
    ///
    /// The data must fit; writes never grow a buffer.
    pub fn write(&mut self, index: usize, data: &[T]) -> Result<(), Error> {
        let end = index.saturating_add(data.len());

        if end > self.elements() {
            return Err(Error::OutOfBounds {
                offset: end,
                size: self.elements(),
            });
        }

        let pointer = self.ptr()?;

        for (position, value) in data.iter().enumerate() {
            unsafe {
                ptr::write_unaligned(
                    pointer.add((index + position) * mem::size_of::<T>()) as *mut T,
                    *value,
                );
            }
        }

        Ok(())
    }

    /// Copy the whole buffer out as a vector of elements.
    pub fn to_vec(&self) -> Result<Vec<T>, Error> {
        self.read(0, self.elements())
    }

    /// Copy the whole buffer out as raw bytes.
    pub fn as_bytes(&self) -> Result<Vec<u8>, Error> {
        let pointer = self.ptr()?;
        let mut result = vec![0u8; self.size];

        unsafe {
            ptr::copy_nonoverlapping(pointer as *const u8, result.as_mut_ptr(), self.size);
        }

        Ok(result)
    }

    /// Write the buffer's bytes to disk verbatim.
    pub fn save<P: AsRef<Path>>(&self, filename: P) -> Result<(), Error> {
        let path = filename.as_ref();
        let bytes = self.as_bytes()?;

        fs::write(path, bytes).map_err(|source| Error::OpenFileFailure {
            path: path.to_path_buf(),
            source,
        })
    }

    fn carve<U: Castable>(
        &self,
        offset: usize,
        size: usize,
        variadic: bool,
    ) -> Result<Buffer<U>, Error> {
        if !variadic && !self.aligns_with(mem::size_of::<U>()) {
            return Err(Error::Alignment {
                left: self.element_size(),
                right: mem::size_of::<U>(),
            });
        }

        if !variadic && mem::size_of::<U>() != 0 && size % mem::size_of::<U>() != 0 {
            return Err(Error::InsufficientData {
                offered: size,
                unit_size: 1,
                needed: mem::size_of::<U>(),
            });
        }

        if offset >= self.size {
            return Err(Error::OutOfBounds {
                offset,
                size: self.size,
            });
        }

        if offset + size > self.size {
            return Err(Error::OutOfBounds {
                offset: offset + size,
                size: self.size,
            });
        }

        let pointer = self.ptr()?;

        let child = Buffer::<U> {
            pointer: unsafe { pointer.add(offset) },
            size,
            allocated: false,
            variadic,
            _element: PhantomData,
        };

        let tracker = BufferTracker::global();
        tracker.relationship(self.key(), child.key());
        tracker.ref_key(child.key());

        Ok(child)
    }

    /// Carve a borrowed sub-view of `elements` elements of type `U` at the given *byte*
    /// offset.
    ///
    /// The view is registered as a child of this buffer: invalidating or reallocating
    /// this buffer invalidates the view.
    pub fn subregion<U: Castable>(&self, offset: usize, elements: usize) -> Result<Buffer<U>, Error> {
        self.carve::<U>(offset, elements.saturating_mul(mem::size_of::<U>()), false)
    }

    /// Carve a borrowed sub-view of `size` bytes of type `U` at the given *byte* offset.
    pub fn subregion_bytes<U: Castable>(&self, offset: usize, size: usize) -> Result<Buffer<U>, Error> {
        self.carve::<U>(offset, size, false)
    }

    /// Carve a borrowed *variadic* sub-view of `size` bytes at the given *byte* offset.
    ///
    /// Variadic views size their single element by the byte length, which is how
    /// variable-length PE structures (whose true size comes from a header field) are
    /// viewed.
    pub fn subregion_variadic<U: Castable>(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Buffer<U>, Error> {
        self.carve::<U>(offset, size, true)
    }

    /// View this whole buffer as elements of type `U`.
    ///
    /// Fails with [`Error::InsufficientData`] when the byte length is not a whole
    /// number of `U` elements.
    pub fn reinterpret<U: Castable>(&self) -> Result<Buffer<U>, Error> {
        if !self.aligns_with(mem::size_of::<U>()) {
            return Err(Error::Alignment {
                left: self.element_size(),
                right: mem::size_of::<U>(),
            });
        }

        if mem::size_of::<U>() == 0 || self.size % mem::size_of::<U>() != 0 {
            return Err(Error::InsufficientData {
                offered: self.size,
                unit_size: 1,
                needed: mem::size_of::<U>(),
            });
        }

        self.carve::<U>(0, self.size, false)
    }

    /// Split the buffer into two borrowed views at the given element midpoint.
    pub fn split_at(&self, midpoint: usize) -> Result<(Buffer<T>, Buffer<T>), Error> {
        let midpoint_bytes = midpoint.saturating_mul(self.element_size());

        if midpoint_bytes > self.size {
            return Err(Error::OutOfBounds {
                offset: midpoint,
                size: self.elements(),
            });
        }

        let left = self.carve::<T>(0, midpoint_bytes, self.variadic)?;
        let right = self.carve::<T>(midpoint_bytes, self.size - midpoint_bytes, self.variadic)?;

        Ok((left, right))
    }

    fn require_resizable(&self) -> Result<(), Error> {
        // a null buffer may grow into an owned one; a borrowed view may not
        if !self.pointer.is_null() && !self.allocated {
            return Err(Error::NotAllocated);
        }

        Ok(())
    }

    /// Release this buffer's allocation, invalidating every view carved from it.
    pub fn deallocate(&mut self) -> Result<(), Error> {
        if !self.allocated {
            return Err(Error::NotAllocated);
        }

        BufferTracker::global().invalidate(self.key());

        unsafe {
            alloc::dealloc(self.pointer, Layout::from_size_align_unchecked(self.size, 1));
        }

        self.pointer = ptr::null_mut();
        self.size = 0;
        self.allocated = false;

        Ok(())
    }

    fn reallocate_bytes(&mut self, size: usize) -> Result<(), Error> {
        self.require_resizable()?;

        let variadic = self.variadic;

        if !self.allocated {
            let mut fresh = Self::allocate_bytes(size)?;
            fresh.variadic = variadic;
            *self = fresh;
            return Ok(());
        }

        let old = self.as_bytes()?;
        self.deallocate()?;

        let mut fresh = Self::allocate_bytes(size)?;
        fresh.variadic = variadic;

        let preserved = cmp::min(old.len(), size);
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), fresh.pointer, preserved);
        }

        *self = fresh;

        Ok(())
    }

    /// Resize the buffer to `elements` elements, zero-filling any growth.
    ///
    /// Only owned (or still-empty) buffers may resize. The backing allocation moves,
    /// so every outstanding sub-view is invalidated.
    pub fn resize(&mut self, elements: usize) -> Result<(), Error> {
        self.reallocate_bytes(elements.saturating_mul(mem::size_of::<T>()))
    }

    /// Resize the buffer to `size` bytes. See [`Buffer::resize`].
    pub fn resize_bytes(&mut self, size: usize) -> Result<(), Error> {
        self.reallocate_bytes(size)
    }

    /// Append the given elements to the end of the buffer, growing it.
    pub fn append(&mut self, data: &[T]) -> Result<(), Error> {
        self.require_resizable()?;

        let old_elements = self.elements();
        self.resize(old_elements + data.len())?;
        self.write(old_elements, data)
    }

    /// Insert the given elements at element `index`, shifting the tail up.
    pub fn insert(&mut self, index: usize, data: &[T]) -> Result<(), Error> {
        self.require_resizable()?;

        let total = self.elements();

        if index > total {
            return Err(Error::OutOfBounds {
                offset: index,
                size: total,
            });
        }

        let tail = self.read(index, total - index)?;
        self.resize(total + data.len())?;
        self.write(index, data)?;
        self.write(index + data.len(), &tail)
    }

    /// Remove the elements in `[start, end)`, shrinking the buffer.
    ///
    /// Erasing the full range deallocates the buffer.
    pub fn erase(&mut self, start: usize, end: usize) -> Result<(), Error> {
        if !self.allocated {
            return Err(Error::NotAllocated);
        }

        let total = self.elements();

        if start == 0 && end == total {
            return self.deallocate();
        }

        if end > total || start > end {
            return Err(Error::OutOfBounds {
                offset: end,
                size: total,
            });
        }

        let tail = self.read(end, total - end)?;
        self.resize(total - (end - start))?;
        self.write(start, &tail)
    }

    /// Append a single element.
    pub fn push(&mut self, value: T) -> Result<(), Error> {
        self.append(&[value])
    }

    /// Remove and return the last element, if any.
    pub fn pop(&mut self) -> Result<Option<T>, Error> {
        if self.elements() == 0 {
            return Ok(None);
        }

        let value = self.get(self.elements() - 1)?;
        self.resize(self.elements() - 1)?;

        Ok(Some(value))
    }

    /// Deallocate the buffer, dropping all data.
    pub fn clear(&mut self) -> Result<(), Error> {
        if !self.allocated {
            return Err(Error::NotAllocated);
        }

        self.deallocate()
    }

    /// Split the buffer at the given element midpoint, keeping the head and returning
    /// the tail as a new owned buffer.
    pub fn split_off(&mut self, midpoint: usize) -> Result<Buffer<T>, Error> {
        if !self.allocated {
            return Err(Error::NotAllocated);
        }

        let total = self.elements();

        if midpoint > total {
            return Err(Error::OutOfBounds {
                offset: midpoint,
                size: total,
            });
        }

        let tail = self.read(midpoint, total - midpoint)?;
        let split = Buffer::from_data(&tail)?;
        self.resize(midpoint)?;

        Ok(split)
    }

    /// Swap the elements at the two given indices.
    pub fn swap(&mut self, left: usize, right: usize) -> Result<(), Error> {
        if left == right {
            return Ok(());
        }

        let left_value = self.get(left)?;
        let right_value = self.get(right)?;
        self.set(left, right_value)?;
        self.set(right, left_value)
    }

    /// Reverse the order of the elements in place.
    pub fn reverse(&mut self) -> Result<(), Error> {
        let total = self.elements();

        for index in 0..total / 2 {
            self.swap(index, total - index - 1)?;
        }

        Ok(())
    }
}

impl<T: Castable + PartialEq> Buffer<T> {
    /// Find every element offset where `term` occurs in the buffer.
    ///
    /// Matching is element-wise equality; the scan is the naive quadratic one, which is
    /// plenty for PE-sized inputs. A term longer than the buffer is out of bounds; an
    /// empty term matches nowhere.
    pub fn search(&self, term: &[T]) -> Result<Vec<usize>, Error> {
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let total = self.elements();

        if term.len() > total {
            return Err(Error::OutOfBounds {
                offset: term.len(),
                size: total,
            });
        }

        let data = self.to_vec()?;
        let mut result = Vec::new();

        for offset in 0..=(total - term.len()) {
            if data[offset..offset + term.len()] == *term {
                result.push(offset);
            }
        }

        Ok(result)
    }

    /// Search for a value of a foreign type `U`, reinterpreted as this buffer's
    /// elements.
    pub fn search_typed<U: Castable>(&self, term: &U) -> Result<Vec<usize>, Error> {
        if !self.aligns_with(mem::size_of::<U>()) {
            return Err(Error::Alignment {
                left: self.element_size(),
                right: mem::size_of::<U>(),
            });
        }

        if mem::size_of::<T>() == 0 || mem::size_of::<U>() % mem::size_of::<T>() != 0 {
            return Err(Error::InsufficientData {
                offered: mem::size_of::<U>(),
                unit_size: 1,
                needed: mem::size_of::<T>(),
            });
        }

        let elements = mem::size_of::<U>() / mem::size_of::<T>();
        let base = term as *const U as *const u8;
        let mut converted = Vec::with_capacity(elements);

        for element in 0..elements {
            unsafe {
                converted.push(ptr::read_unaligned(
                    base.add(element * mem::size_of::<T>()) as *const T,
                ));
            }
        }

        self.search(&converted)
    }

    /// Check whether `term` occurs anywhere in the buffer.
    pub fn contains(&self, term: &[T]) -> Result<bool, Error> {
        Ok(!self.search(term)?.is_empty())
    }

    /// Check whether a value of a foreign type `U` occurs anywhere in the buffer.
    pub fn contains_typed<U: Castable>(&self, term: &U) -> Result<bool, Error> {
        Ok(!self.search_typed(term)?.is_empty())
    }

    /// Search with wildcards: `None` entries in `term` match any element.
    ///
    /// Returns the matching offsets along with the data that matched. A term of
    /// nothing but wildcards fails with [`Error::SearchTooBroad`].
    pub fn search_dynamic(&self, term: &[Option<T>]) -> Result<Vec<(usize, Vec<T>)>, Error> {
        let total = self.elements();

        if term.len() > total {
            return Err(Error::OutOfBounds {
                offset: term.len(),
                size: total,
            });
        }

        if term.iter().all(|entry| entry.is_none()) {
            return Err(Error::SearchTooBroad);
        }

        let data = self.to_vec()?;
        let mut result = Vec::new();

        for offset in 0..=(total - term.len()) {
            let found = term.iter().enumerate().all(|(index, entry)| match entry {
                Some(value) => data[offset + index] == *value,
                None => true,
            });

            if found {
                result.push((offset, data[offset..offset + term.len()].to_vec()));
            }
        }

        Ok(result)
    }
}

impl<T: Castable> Default for Buffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Castable> Drop for Buffer<T> {
    fn drop(&mut self) {
        if self.allocated {
            BufferTracker::global().invalidate(self.key());

            unsafe {
                alloc::dealloc(self.pointer, Layout::from_size_align_unchecked(self.size, 1));
            }
        } else if !self.pointer.is_null() {
            BufferTracker::global().deref_key(self.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &[u8] = &[
        0xDE, 0xAD, 0xBE, 0xEF, 0xAB, 0xAD, 0x1D, 0xEA, 0xDE, 0xAD, 0xBE, 0xA7, 0xDE, 0xFA, 0xCE,
        0xD1,
    ];

    #[repr(packed)]
    #[derive(Copy, Clone, PartialEq)]
    struct SixByteStructure {
        dword: u32,
        word: u16,
    }
    unsafe impl Castable for SixByteStructure {}

    #[test]
    fn test_readonly_view() {
        let backing = DATA.to_vec();
        let buffer = unsafe { Buffer::<u8>::from_ptr(backing.as_ptr(), backing.len()) }.unwrap();

        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.byte_len(), 16);
        assert!(!buffer.is_allocated());
        assert!(matches!(
            buffer.get(16),
            Err(Error::OutOfBounds {
                offset: 16,
                size: 16
            })
        ));

        assert_eq!(buffer.get_typed::<i8>(0).unwrap(), -34);
        assert!(matches!(
            buffer.get_typed::<i8>(16),
            Err(Error::OutOfBounds { .. })
        ));

        let dwords = buffer.reinterpret::<u32>().unwrap();
        assert_eq!(dwords.len(), 4);
        assert_eq!(dwords.get(2).unwrap(), 0xA7BEADDE);

        assert_eq!(buffer.search_typed::<u32>(&0xD1CEFADE).unwrap(), vec![12]);
        assert!(buffer.search_typed::<u32>(&0xFACEBABE).unwrap().is_empty());
        assert!(buffer.contains_typed::<u32>(&0xEFBEADDE).unwrap());
        assert!(!buffer.contains_typed::<u32>(&0xDEADBEEF).unwrap());

        let (first, second) = buffer.split_at(8).unwrap();
        assert_eq!(first.to_vec().unwrap(), DATA[..8].to_vec());
        assert_eq!(second.to_vec().unwrap(), DATA[8..].to_vec());
    }

    #[test]
    fn test_alignment() {
        let buffer = Buffer::<u8>::from_data(DATA).unwrap();

        let dwords = buffer.subregion::<u32>(0, 4).unwrap();
        assert_eq!(dwords.get(0).unwrap(), 0xEFBEADDE);

        let sixes = buffer.subregion::<SixByteStructure>(0, 2).unwrap();
        let six = sixes.get(0).unwrap();
        let word = six.word;
        assert_eq!(word, 0xADAB);

        // a six-byte structure does not divide a four-byte element
        assert!(matches!(
            dwords.subregion::<SixByteStructure>(0, 2),
            Err(Error::Alignment { left: 4, right: 6 })
        ));

        // u16 reads from a u32 buffer only on two-byte boundaries
        assert_eq!(dwords.get_typed::<u16>(2).unwrap(), 0xEFBE);
        assert!(matches!(
            dwords.get_typed::<u16>(1),
            Err(Error::Alignment { .. })
        ));
    }

    #[test]
    fn test_reads_and_writes() {
        let mut buffer = Buffer::<u8>::from_data(DATA).unwrap();

        assert_eq!(buffer.read(8, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xA7]);
        assert_eq!(buffer.read(0xC, 4).unwrap(), vec![0xDE, 0xFA, 0xCE, 0xD1]);
        assert!(matches!(buffer.read(0xD, 4), Err(Error::OutOfBounds { .. })));

        buffer.write(0, &[0x4D, 0x5A]).unwrap();
        assert_eq!(buffer.read(0, 2).unwrap(), vec![0x4D, 0x5A]);

        buffer.write_typed::<u32>(4, 0xCAFEBABE).unwrap();
        assert_eq!(buffer.get_typed::<u32>(4).unwrap(), 0xCAFEBABE);

        assert_eq!(buffer.front().unwrap(), 0x4D);
        assert_eq!(buffer.back().unwrap(), 0xD1);
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = Buffer::<u8>::new();

        assert!(buffer.is_empty());
        assert!(matches!(
            buffer.get(0),
            Err(Error::OutOfBounds { offset: 0, size: 0 })
        ));
    }

    #[test]
    fn test_dynamic_search() {
        let data: &[u8] = &[
            0xFF, 0x27, 0x63, 0x58, 0x27, 0x64, 0xFF, 0x27, 0x64, 0x88, 0x65, 0x43, 0x27, 0x38,
            0x48, 0x58, 0x64, 0x27, 0x64,
        ];
        let buffer = Buffer::<u8>::from_data(data).unwrap();

        let term = [None, Some(0x27), Some(0x64), None, Some(0x27), Some(0x64)];
        let matches = buffer.search_dynamic(&term).unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, vec![0x58, 0x27, 0x64, 0xFF, 0x27, 0x64]);

        let wildcards = [None::<u8>; 4];
        assert!(matches!(
            buffer.search_dynamic(&wildcards),
            Err(Error::SearchTooBroad)
        ));
    }

    #[test]
    fn test_deallocation_invalidates_views() {
        let mut owner = Buffer::<u8>::allocate(16).unwrap();
        let view = owner.subregion::<u8>(0, 4).unwrap();

        assert_eq!(view.get(0).unwrap(), 0);

        owner.deallocate().unwrap();

        assert!(matches!(view.get(0), Err(Error::DanglingView { size: 4, .. })));
        assert!(matches!(view.to_vec(), Err(Error::DanglingView { .. })));
    }

    #[test]
    fn test_resize_invalidates_views() {
        let mut owner = Buffer::<u8>::from_data(DATA).unwrap();
        let view = owner.subregion::<u32>(4, 2).unwrap();
        let alias = owner.reinterpret::<u32>().unwrap();

        assert_eq!(view.get(0).unwrap(), 0xEA1DADAB);

        owner.append(&[0u8; 16]).unwrap();

        assert!(matches!(view.get(0), Err(Error::DanglingView { .. })));
        assert!(matches!(alias.get(0), Err(Error::DanglingView { .. })));
        assert_eq!(owner.len(), 32);
        assert_eq!(owner.read(0, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_mutation_requires_ownership() {
        let mut backing = DATA.to_vec();
        let length = backing.len();
        let mut view =
            unsafe { Buffer::<u8>::from_ptr(backing.as_mut_ptr() as *const u8, length) }.unwrap();

        assert!(matches!(view.resize(32), Err(Error::NotAllocated)));
        assert!(matches!(view.append(&[0]), Err(Error::NotAllocated)));
        assert!(matches!(view.deallocate(), Err(Error::NotAllocated)));

        // non-growing writes through a borrowed view are fine
        view.set(0, 0x4D).unwrap();
        assert_eq!(backing[0], 0x4D);
    }

    #[test]
    fn test_insert_and_erase() {
        let mut buffer = Buffer::<u8>::from_data(&[1, 2, 3, 4]).unwrap();

        buffer.insert(2, &[9, 9]).unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![1, 2, 9, 9, 3, 4]);

        buffer.erase(1, 3).unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![1, 9, 3, 4]);

        buffer.erase(0, 4).unwrap();
        assert!(buffer.is_empty());
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_split_off_and_stack_ops() {
        let mut buffer = Buffer::<u8>::from_data(&[1, 2, 3, 4, 5, 6]).unwrap();

        let tail = buffer.split_off(4).unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(tail.to_vec().unwrap(), vec![5, 6]);
        assert!(tail.is_allocated());

        buffer.push(7).unwrap();
        assert_eq!(buffer.pop().unwrap(), Some(7));
        assert_eq!(buffer.pop().unwrap(), Some(4));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_swap_and_reverse() {
        let mut buffer = Buffer::<u8>::from_data(&[1, 2, 3, 4, 5]).unwrap();

        buffer.swap(0, 4).unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![5, 2, 3, 4, 1]);

        buffer.reverse().unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![1, 4, 3, 2, 5]);
    }

    #[test]
    fn test_insufficient_allocation() {
        assert!(matches!(
            Buffer::<u32>::allocate_bytes(2),
            Err(Error::InsufficientAllocation {
                attempted: 2,
                needed: 4
            })
        ));
    }

    #[test]
    fn test_reinterpret_insufficient_data() {
        let buffer = Buffer::<u8>::from_data(&[1, 2, 3, 4, 5, 6]).unwrap();

        assert!(matches!(
            buffer.reinterpret::<u32>(),
            Err(Error::InsufficientData {
                offered: 6,
                needed: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_variadic_view() {
        let buffer = Buffer::<u8>::from_data(DATA).unwrap();
        let variadic = buffer.subregion_variadic::<u32>(0, 12).unwrap();

        assert!(variadic.is_variadic());
        assert_eq!(variadic.elements(), 1);
        assert_eq!(variadic.element_size(), 12);
        assert_eq!(variadic.get(0).unwrap(), 0xEFBEADDE);

        // byte-addressable regardless of either type's size
        assert_eq!(variadic.get_typed::<u16>(5).unwrap(), 0x1DAD);
        let inner = variadic.subregion::<SixByteStructure>(1, 1).unwrap();
        let six = inner.get(0).unwrap();
        let dword = six.dword;
        assert_eq!(dword, 0xABEFBEAD);
    }

    #[test]
    fn test_file_roundtrip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let buffer = Buffer::<u8>::from_data(DATA).unwrap();

        buffer.save(file.path()).unwrap();

        let reloaded = Buffer::<u8>::from_file(file.path()).unwrap();
        assert_eq!(reloaded.to_vec().unwrap(), DATA.to_vec());

        assert!(matches!(
            Buffer::<u8>::from_file("this/file/does/not/exist"),
            Err(Error::OpenFileFailure { .. })
        ));
    }
}
