//! Marshaling between host buffers and guest linear memory.
//!
//! The host never dereferences guest memory directly. Every byte goes through
//! wasmtime's bounds-checked `Memory::read`/`Memory::write`, and every block is
//! obtained from (and returned to) the guest's own `malloc`/`free` exports.

use std::fmt;

use wasmtime::{AsContext, AsContextMut, Memory, TypedFunc};

use crate::abi::{EXPORT_FREE, EXPORT_MALLOC};
use crate::error::Error;
use crate::module::HostState;

/// A 32-bit offset into a guest's linear memory.
///
/// Only meaningful for the instance that produced it. Zero is the null
/// sentinel used throughout the guest ABI for "no value".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GuestPtr(u32);

impl GuestPtr {
    /// The null pointer.
    pub const NULL: Self = Self(0);

    /// Wrap a raw guest offset.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw guest offset.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the null sentinel.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by `bytes`, or `None` on 32-bit overflow.
    #[must_use]
    pub const fn checked_add(self, bytes: u32) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    const fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GuestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A block of guest memory owned by the host.
///
/// Obtained from the guest allocator. It must either be freed or handed over
/// to the guest; both consume it, so a freed pointer cannot be reused through
/// this type.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "guest allocations leak unless freed or handed over to the guest"]
pub struct Allocation {
    ptr: GuestPtr,
    len: u32,
}

impl Allocation {
    /// Start of the block.
    #[must_use]
    pub const fn ptr(&self) -> GuestPtr {
        self.ptr
    }

    /// Size of the block in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Whether the block is zero-sized.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Handles to the guest's memory and allocator exports.
///
/// Generic over the store context so the same code serves the dispatcher
/// (holding the `Store`) and the plugin gateway (holding a `Caller`).
#[derive(Clone)]
pub(crate) struct Marshaler {
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
}

impl Marshaler {
    pub(crate) const fn new(
        memory: Memory,
        malloc: TypedFunc<u32, u32>,
        free: TypedFunc<u32, ()>,
    ) -> Self {
        Self {
            memory,
            malloc,
            free,
        }
    }

    /// Allocate a guest block holding a copy of `data`.
    pub(crate) async fn allocate_bytes<S>(
        &self,
        store: &mut S,
        data: &[u8],
    ) -> Result<Allocation, Error>
    where
        S: AsContextMut<Data = HostState>,
    {
        let len = u32::try_from(data.len()).map_err(|_| {
            Error::AllocationFailed(format!(
                "{} bytes exceeds the 32-bit guest address space",
                data.len()
            ))
        })?;

        let raw = self
            .malloc
            .call_async(&mut *store, len)
            .await
            .map_err(|e| Error::AllocationFailed(format!("{EXPORT_MALLOC}({len}) trapped: {e}")))?;
        if raw == 0 {
            return Err(Error::AllocationFailed(format!(
                "{EXPORT_MALLOC}({len}) returned null"
            )));
        }

        let allocation = Allocation {
            ptr: GuestPtr(raw),
            len,
        };
        store.as_context_mut().data_mut().allocations += 1;

        if let Err(e) = self.write_bytes(&mut *store, allocation.ptr, data) {
            self.free(store, allocation).await;
            return Err(e);
        }
        Ok(allocation)
    }

    /// Allocate a null-terminated copy of `s`.
    pub(crate) async fn allocate_string<S>(
        &self,
        store: &mut S,
        s: &str,
    ) -> Result<Allocation, Error>
    where
        S: AsContextMut<Data = HostState>,
    {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.allocate_bytes(store, &bytes).await
    }

    /// Allocate an array of little-endian 32-bit pointers (an `argv`).
    pub(crate) async fn allocate_pointer_array<S>(
        &self,
        store: &mut S,
        pointers: &[GuestPtr],
    ) -> Result<Allocation, Error>
    where
        S: AsContextMut<Data = HostState>,
    {
        let bytes: Vec<u8> = pointers
            .iter()
            .flat_map(|ptr| ptr.get().to_le_bytes())
            .collect();
        self.allocate_bytes(store, &bytes).await
    }

    /// Return an allocation to the guest allocator.
    pub(crate) async fn free<S>(&self, store: &mut S, allocation: Allocation)
    where
        S: AsContextMut<Data = HostState>,
    {
        {
            let mut ctx = store.as_context_mut();
            let state = ctx.data_mut();
            state.allocations = state.allocations.saturating_sub(1);
        }
        self.free_ptr(store, allocation.ptr).await;
    }

    /// Free every allocation in `allocations`.
    pub(crate) async fn free_all<S>(&self, store: &mut S, allocations: Vec<Allocation>)
    where
        S: AsContextMut<Data = HostState>,
    {
        for allocation in allocations.into_iter().rev() {
            self.free(store, allocation).await;
        }
    }

    /// Call the guest `free` export. Null is a no-op.
    ///
    /// Never fails to the caller. A trap inside the guest deallocator means the
    /// guest heap can no longer be trusted, so it is recorded as an instance
    /// fault.
    pub(crate) async fn free_ptr<S>(&self, store: &mut S, ptr: GuestPtr)
    where
        S: AsContextMut<Data = HostState>,
    {
        if ptr.is_null() {
            return;
        }
        if let Err(e) = self.free.call_async(&mut *store, ptr.get()).await {
            tracing::error!(%ptr, error = %e, "Guest free trapped, instance marked faulted");
            store
                .as_context_mut()
                .data_mut()
                .record_fault(format!("{EXPORT_FREE}({ptr}) trapped: {e}"));
        }
    }

    /// Give an allocation to the guest, which becomes responsible for freeing it.
    pub(crate) fn hand_over<S>(&self, store: &mut S, allocation: Allocation) -> (GuestPtr, u32)
    where
        S: AsContextMut<Data = HostState>,
    {
        let mut ctx = store.as_context_mut();
        let state = ctx.data_mut();
        state.allocations = state.allocations.saturating_sub(1);
        (allocation.ptr, allocation.len)
    }

    /// Copy `len` bytes out of guest memory.
    pub(crate) fn read_bytes(
        &self,
        store: impl AsContext,
        ptr: GuestPtr,
        len: u32,
    ) -> Result<Vec<u8>, Error> {
        let len = len as usize;
        let out_of_bounds = Error::MemoryAccessFailed { ptr, len };
        // Check before allocating so a hostile length can't size a host buffer.
        let end = ptr.offset().checked_add(len).ok_or(Error::MemoryAccessFailed { ptr, len })?;
        if end > self.memory.data_size(&store) {
            return Err(out_of_bounds);
        }
        let mut buf = vec![0; len];
        self.memory
            .read(&store, ptr.offset(), &mut buf)
            .map_err(|_| out_of_bounds)?;
        Ok(buf)
    }

    /// Copy `data` into guest memory at `ptr`.
    pub(crate) fn write_bytes(
        &self,
        store: impl AsContextMut,
        ptr: GuestPtr,
        data: &[u8],
    ) -> Result<(), Error> {
        self.memory
            .write(store, ptr.offset(), data)
            .map_err(|_| Error::MemoryAccessFailed {
                ptr,
                len: data.len(),
            })
    }

    /// Store a little-endian `u32` at `addr`.
    pub(crate) fn write_u32(
        &self,
        store: impl AsContextMut,
        addr: GuestPtr,
        value: u32,
    ) -> Result<(), Error> {
        self.write_bytes(store, addr, &value.to_le_bytes())
    }
}

/// An argument vector living in guest memory.
///
/// Holds one null-terminated string per argument plus the pointer array
/// referencing them, all owned by the host until [`GuestArgv::free`].
#[derive(Debug)]
pub(crate) struct GuestArgv {
    strings: Vec<Allocation>,
    array: Allocation,
    argc: i32,
}

impl GuestArgv {
    /// Copy `args` into guest memory.
    ///
    /// On failure every block allocated so far is freed before returning.
    pub(crate) async fn allocate<S>(
        marshaler: &Marshaler,
        store: &mut S,
        args: &[String],
    ) -> Result<Self, Error>
    where
        S: AsContextMut<Data = HostState>,
    {
        let argc = i32::try_from(args.len()).map_err(|_| {
            Error::AllocationFailed(format!("{} arguments exceeds argc range", args.len()))
        })?;

        let mut strings = Vec::with_capacity(args.len());
        for arg in args {
            match marshaler.allocate_string(store, arg).await {
                Ok(allocation) => strings.push(allocation),
                Err(e) => {
                    marshaler.free_all(store, strings).await;
                    return Err(e);
                }
            }
        }

        let pointers: Vec<GuestPtr> = strings.iter().map(Allocation::ptr).collect();
        match marshaler.allocate_pointer_array(store, &pointers).await {
            Ok(array) => Ok(Self {
                strings,
                array,
                argc,
            }),
            Err(e) => {
                marshaler.free_all(store, strings).await;
                Err(e)
            }
        }
    }

    pub(crate) const fn argc(&self) -> i32 {
        self.argc
    }

    pub(crate) const fn argv(&self) -> GuestPtr {
        self.array.ptr
    }

    /// Free the pointer array and every argument string.
    pub(crate) async fn free<S>(self, marshaler: &Marshaler, store: &mut S)
    where
        S: AsContextMut<Data = HostState>,
    {
        marshaler.free(store, self.array).await;
        marshaler.free_all(store, self.strings).await;
    }
}
