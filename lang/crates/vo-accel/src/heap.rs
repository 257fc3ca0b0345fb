//! Managed heap model used by the dispatch bridge.
//!
//! Objects live in cells addressed by [`ObjRef`]. Each cell owns a raw
//! storage block; [`Heap::relocate`] moves every unpinned block to a fresh
//! allocation, the way a moving collector would. A [`Pinned`] guard keeps a
//! cell's address stable until it is dropped.
//!
//! [`Heap::free`] releases a cell. Its slot is reused by later allocations
//! under a new generation, so the heap stays as large as its live set and
//! stale references are reported instead of aliasing new objects.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::descriptor::ElemKind;
use crate::error::DispatchError;

/// Handle of a heap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.generation {
            0 => write!(f, "@{}", self.index),
            g => write!(f, "@{}#{}", self.index, g),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Instance { class: String },
    Array(ElemKind),
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Instance { class } => f.write_str(class),
            ObjectKind::Array(elem) => write!(f, "{}[]", elem.name()),
        }
    }
}

// ==================== Storage ====================

/// Word-aligned zeroed block. Never empty, so every cell has a distinct address.
struct Storage {
    ptr: NonNull<u64>,
    words: usize,
}

// The block is only reached through the heap lock or a pin.
unsafe impl Send for Storage {}

impl Storage {
    fn zeroed(bytes: usize) -> Self {
        let words = bytes.div_ceil(8).max(1);
        let block: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(block).cast::<u64>()).unwrap_or(NonNull::dangling());
        Self { ptr, words }
    }

    fn duplicate(&self) -> Self {
        let copy = Self::zeroed(self.words * 8);
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), copy.ptr.as_ptr(), self.words) };
        copy
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.words * 8
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.words)));
        }
    }
}

struct Cell {
    kind: ObjectKind,
    /// Elements for arrays, field slots for instances.
    len: usize,
    storage: Storage,
    pins: u32,
}

// ==================== Array elements ====================

mod sealed {
    pub trait Sealed {}
}

/// Primitive types that can be stored in heap arrays.
pub trait ArrayElement: Copy + sealed::Sealed {
    const KIND: ElemKind;

    /// # Safety
    /// `base` must point to at least `index + 1` elements.
    unsafe fn read(base: *const u8, index: usize) -> Self;

    /// # Safety
    /// `base` must point to at least `index + 1` elements.
    unsafe fn write(base: *mut u8, index: usize, value: Self);
}

macro_rules! array_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl ArrayElement for $ty {
                const KIND: ElemKind = ElemKind::$kind;

                unsafe fn read(base: *const u8, index: usize) -> Self {
                    base.cast::<$ty>().add(index).read()
                }

                unsafe fn write(base: *mut u8, index: usize, value: Self) {
                    base.cast::<$ty>().add(index).write(value)
                }
            }
        )*
    };
}

array_element! {
    i8 => Byte,
    u16 => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
}

impl sealed::Sealed for bool {}

// Stored as one byte; any non-zero byte written by native code reads as true.
impl ArrayElement for bool {
    const KIND: ElemKind = ElemKind::Boolean;

    unsafe fn read(base: *const u8, index: usize) -> Self {
        base.add(index).read() != 0
    }

    unsafe fn write(base: *mut u8, index: usize, value: Self) {
        base.add(index).write(u8::from(value))
    }
}

// ==================== Heap ====================

struct Slot {
    generation: u32,
    cell: Option<Cell>,
}

#[derive(Default)]
struct Cells {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Storage start address to slot index.
    by_address: BTreeMap<usize, u32>,
}

impl Cells {
    fn get(&self, obj: ObjRef) -> Result<&Cell, DispatchError> {
        self.slots
            .get(obj.index())
            .filter(|slot| slot.generation == obj.generation)
            .and_then(|slot| slot.cell.as_ref())
            .ok_or(DispatchError::InvalidReference(obj))
    }

    fn get_mut(&mut self, obj: ObjRef) -> Result<&mut Cell, DispatchError> {
        self.slots
            .get_mut(obj.index())
            .filter(|slot| slot.generation == obj.generation)
            .and_then(|slot| slot.cell.as_mut())
            .ok_or(DispatchError::InvalidReference(obj))
    }

    fn insert(&mut self, cell: Cell) -> ObjRef {
        let start = cell.storage.base() as usize;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].cell = Some(cell);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    cell: Some(cell),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.by_address.insert(start, index);
        ObjRef {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

pub struct Heap {
    cells: Mutex<Cells>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(Cells::default()),
        }
    }

    /// Allocate an instance with `fields` 64-bit slots.
    pub fn new_object(&self, class: &str, fields: usize) -> ObjRef {
        self.alloc(
            ObjectKind::Instance {
                class: class.to_string(),
            },
            fields,
            Storage::zeroed(fields * 8),
        )
    }

    /// Allocate a zeroed array.
    pub fn new_array(&self, elem: ElemKind, len: usize) -> ObjRef {
        self.alloc(ObjectKind::Array(elem), len, Storage::zeroed(len * elem.size()))
    }

    pub fn new_array_from<T: ArrayElement>(&self, values: &[T]) -> ObjRef {
        let storage = Storage::zeroed(values.len() * T::KIND.size());
        for (i, &v) in values.iter().enumerate() {
            unsafe { T::write(storage.base(), i, v) };
        }
        self.alloc(ObjectKind::Array(T::KIND), values.len(), storage)
    }

    fn alloc(&self, kind: ObjectKind, len: usize, storage: Storage) -> ObjRef {
        self.cells.lock().insert(Cell {
            kind,
            len,
            storage,
            pins: 0,
        })
    }

    /// Release `obj`. Fails if it is stale or still pinned.
    pub fn free(&self, obj: ObjRef) -> Result<(), DispatchError> {
        let mut guard = self.cells.lock();
        let cells = &mut *guard;
        let cell = cells.get(obj)?;
        if cell.pins > 0 {
            return Err(DispatchError::StillPinned(obj));
        }
        let start = cell.storage.base() as usize;
        cells.by_address.remove(&start);
        let slot = &mut cells.slots[obj.index()];
        slot.cell = None;
        slot.generation = slot.generation.wrapping_add(1);
        cells.free.push(obj.index);
        Ok(())
    }

    pub fn kind(&self, obj: ObjRef) -> Result<ObjectKind, DispatchError> {
        Ok(self.cells.lock().get(obj)?.kind.clone())
    }

    /// Element count of an array.
    pub fn array_len(&self, obj: ObjRef) -> Result<usize, DispatchError> {
        let cells = self.cells.lock();
        let cell = cells.get(obj)?;
        match cell.kind {
            ObjectKind::Array(_) => Ok(cell.len),
            ref other => Err(wrong_kind(obj, "array", other)),
        }
    }

    pub fn read_array<T: ArrayElement>(&self, obj: ObjRef) -> Result<Vec<T>, DispatchError> {
        let cells = self.cells.lock();
        let cell = typed_array::<T>(&cells, obj)?;
        let base = cell.storage.base();
        Ok((0..cell.len).map(|i| unsafe { T::read(base, i) }).collect())
    }

    /// Overwrite the first `values.len()` elements.
    pub fn write_array<T: ArrayElement>(&self, obj: ObjRef, values: &[T]) -> Result<(), DispatchError> {
        let cells = self.cells.lock();
        let cell = typed_array::<T>(&cells, obj)?;
        if values.len() > cell.len {
            return Err(DispatchError::WrongKind {
                obj,
                expected: format!("at least {} elements", values.len()),
                found: format!("{} elements", cell.len),
            });
        }
        let base = cell.storage.base();
        for (i, &v) in values.iter().enumerate() {
            unsafe { T::write(base, i, v) };
        }
        Ok(())
    }

    /// Field slot `index` of an instance.
    pub fn read_field(&self, obj: ObjRef, index: usize) -> Result<i64, DispatchError> {
        let cells = self.cells.lock();
        let cell = field_slot(&cells, obj, index)?;
        Ok(unsafe { i64::read(cell.storage.base(), index) })
    }

    pub fn write_field(&self, obj: ObjRef, index: usize, value: i64) -> Result<(), DispatchError> {
        let cells = self.cells.lock();
        let cell = field_slot(&cells, obj, index)?;
        unsafe { i64::write(cell.storage.base(), index, value) };
        Ok(())
    }

    /// Current storage address. Only stable while pinned.
    pub fn address(&self, obj: ObjRef) -> Result<usize, DispatchError> {
        Ok(self.cells.lock().get(obj)?.storage.base() as usize)
    }

    /// Map a storage address back to its cell.
    pub fn resolve_address(&self, addr: usize) -> Option<ObjRef> {
        let cells = self.cells.lock();
        let (_, &index) = cells.by_address.range(..=addr).next_back()?;
        let slot = &cells.slots[index as usize];
        slot.cell
            .as_ref()
            .filter(|cell| cell.storage.contains(addr))
            .map(|_| ObjRef {
                index,
                generation: slot.generation,
            })
    }

    /// Pin `obj` until the guard drops.
    pub fn pin(&self, obj: ObjRef) -> Result<Pinned<'_>, DispatchError> {
        let mut cells = self.cells.lock();
        let cell = cells.get_mut(obj)?;
        cell.pins += 1;
        Ok(Pinned {
            heap: self,
            obj,
            base: cell.storage.base(),
            len: cell.len,
        })
    }

    pub fn is_pinned(&self, obj: ObjRef) -> bool {
        self.cells.lock().get(obj).is_ok_and(|c| c.pins > 0)
    }

    /// Move every unpinned cell to new storage. Returns how many moved.
    pub fn relocate(&self) -> usize {
        let mut guard = self.cells.lock();
        let Cells { slots, by_address, .. } = &mut *guard;
        let mut moved = 0;
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(cell) = slot.cell.as_mut().filter(|c| c.pins == 0) else {
                continue;
            };
            by_address.remove(&(cell.storage.base() as usize));
            // The copy is allocated before the old block is freed, so the
            // address always changes.
            cell.storage = cell.storage.duplicate();
            by_address.insert(cell.storage.base() as usize, index as u32);
            moved += 1;
        }
        tracing::trace!(moved, "heap relocated");
        moved
    }

    /// Live cells.
    pub fn len(&self) -> usize {
        self.cells.lock().live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unpin(&self, obj: ObjRef) {
        let mut cells = self.cells.lock();
        if let Ok(cell) = cells.get_mut(obj) {
            debug_assert!(cell.pins > 0, "unbalanced unpin of {}", obj);
            cell.pins = cell.pins.saturating_sub(1);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("cells", &self.len()).finish()
    }
}

fn typed_array<T: ArrayElement>(cells: &Cells, obj: ObjRef) -> Result<&Cell, DispatchError> {
    let cell = cells.get(obj)?;
    match cell.kind {
        ObjectKind::Array(elem) if elem == T::KIND => Ok(cell),
        ref other => Err(wrong_kind(obj, &format!("{}[]", T::KIND.name()), other)),
    }
}

fn field_slot(cells: &Cells, obj: ObjRef, index: usize) -> Result<&Cell, DispatchError> {
    let cell = cells.get(obj)?;
    match cell.kind {
        ObjectKind::Instance { .. } if index < cell.len => Ok(cell),
        ObjectKind::Instance { .. } => Err(DispatchError::WrongKind {
            obj,
            expected: format!("field slot {}", index),
            found: format!("{} fields", cell.len),
        }),
        ref other => Err(wrong_kind(obj, "instance", other)),
    }
}

fn wrong_kind(obj: ObjRef, expected: &str, found: &ObjectKind) -> DispatchError {
    DispatchError::WrongKind {
        obj,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Keeps a cell's storage in place. Released on drop.
pub struct Pinned<'h> {
    heap: &'h Heap,
    obj: ObjRef,
    base: *mut u8,
    len: usize,
}

impl Pinned<'_> {
    pub fn obj(&self) -> ObjRef {
        self.obj
    }

    /// Stable storage address for the lifetime of the guard.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        self.heap.unpin(self.obj);
    }
}
