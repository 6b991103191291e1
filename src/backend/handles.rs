// Opaque resource handles and the tables that translate them back
//
// A handle carries the raw value of the native object (Vulkan handle,
// COM pointer, GL object name). Each backend keeps one ResourceTable per
// resource kind holding the native object and whatever creation info it
// needs later (strides, formats, layouts).
//
// Some resources have no single native object to name them: GL image views
// (a texture shared between views plus an optional framebuffer), D3D11
// pipelines (several state objects) and D3D12 shaders (plain bytecode).
// Their tables mint sequential handles with `insert_next` instead.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Common behaviour of all handle newtypes
pub trait Handle: Copy + Eq + Hash + fmt::Debug {
    /// Resource kind used in error messages
    const KIND: &'static str;

    fn from_raw(raw: u64) -> Self;
    fn as_raw(self) -> u64;
}

macro_rules! define_handle {
    ($name:ident, $kind:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl Handle for $name {
            const KIND: &'static str = $kind;

            fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

define_handle!(ImageHandle, "image");
define_handle!(ImageViewHandle, "image view");
define_handle!(SamplerHandle, "sampler");
define_handle!(BufferHandle, "buffer");
define_handle!(ShaderHandle, "shader");
define_handle!(PipelineHandle, "pipeline");

/// Handle -> native object translation table
pub struct ResourceTable<H: Handle, T> {
    entries: HashMap<H, T>,
    next: u64,
}

impl<H: Handle, T> Default for ResourceTable<H, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
        }
    }
}

impl<H: Handle, T> ResourceTable<H, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, failing if the handle is already tracked
    pub fn insert(&mut self, handle: H, value: T) -> Result<H> {
        if self.entries.contains_key(&handle) {
            anyhow::bail!("{} {:?} is already registered", H::KIND, handle);
        }
        self.entries.insert(handle, value);
        Ok(handle)
    }

    /// Insert under a freshly minted handle; never reuses a live one
    pub fn insert_next(&mut self, value: T) -> H {
        let mut handle = H::from_raw(self.next);
        while self.entries.contains_key(&handle) {
            self.next = self.next.wrapping_add(1).max(1);
            handle = H::from_raw(self.next);
        }
        self.next = self.next.wrapping_add(1).max(1);
        self.entries.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: H) -> Result<&T> {
        self.entries
            .get(&handle)
            .ok_or_else(|| anyhow!("Unknown {} {:?}", H::KIND, handle))
    }

    pub fn get_mut(&mut self, handle: H) -> Result<&mut T> {
        self.entries
            .get_mut(&handle)
            .ok_or_else(|| anyhow!("Unknown {} {:?}", H::KIND, handle))
    }

    pub fn remove(&mut self, handle: H) -> Result<T> {
        self.entries
            .remove(&handle)
            .ok_or_else(|| anyhow!("Unknown {} {:?}", H::KIND, handle))
    }

    pub fn contains(&self, handle: H) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.entries.values_mut()
    }

    /// Remove every entry, yielding them for native cleanup
    pub fn drain(&mut self) -> impl Iterator<Item = (H, T)> + '_ {
        self.entries.drain()
    }

    /// Remove the entries matching `pred`, yielding them for native cleanup
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<(H, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let keys: Vec<H> = self
            .entries
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|v| (k, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut table: ResourceTable<BufferHandle, usize> = ResourceTable::new();
        let handle = table.insert(BufferHandle::from_raw(0x1000), 48).unwrap();
        assert_eq!(*table.get(handle).unwrap(), 48);
        *table.get_mut(handle).unwrap() = 64;
        assert_eq!(table.remove(handle).unwrap(), 64);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_handle_names_the_kind() {
        let table: ResourceTable<PipelineHandle, ()> = ResourceTable::new();
        let err = table.get(PipelineHandle::from_raw(3)).unwrap_err();
        assert!(err.to_string().contains("pipeline"));
    }

    #[test]
    fn double_insert_is_rejected() {
        let mut table: ResourceTable<ImageHandle, u32> = ResourceTable::new();
        table.insert(ImageHandle::from_raw(1), 1).unwrap();
        assert!(table.insert(ImageHandle::from_raw(1), 2).is_err());
        assert_eq!(*table.get(ImageHandle::from_raw(1)).unwrap(), 1);
    }

    #[test]
    fn drain_where_only_takes_matches() {
        let mut table: ResourceTable<ImageHandle, bool> = ResourceTable::new();
        table.insert(ImageHandle::from_raw(1), true).unwrap();
        table.insert(ImageHandle::from_raw(2), false).unwrap();
        table.insert(ImageHandle::from_raw(3), true).unwrap();
        let drained = table.drain_where(|imported| *imported);
        assert_eq!(drained.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.contains(ImageHandle::from_raw(2)));
    }

    #[test]
    fn minted_handles_are_distinct_and_nonzero() {
        let mut table: ResourceTable<ImageViewHandle, &str> = ResourceTable::new();
        let a = table.insert_next("colour");
        let b = table.insert_next("depth");
        assert_ne!(a, b);
        assert_ne!(a.as_raw(), 0);
        assert_eq!(*table.get(b).unwrap(), "depth");
    }

    #[test]
    fn minted_handles_are_not_reused_after_removal() {
        let mut table: ResourceTable<PipelineHandle, u8> = ResourceTable::new();
        let first = table.insert_next(1);
        table.remove(first).unwrap();
        let second = table.insert_next(2);
        assert_ne!(first, second);
        assert!(table.get(first).is_err());
    }

    #[test]
    fn minted_handles_skip_explicit_entries() {
        let mut table: ResourceTable<ShaderHandle, u8> = ResourceTable::new();
        table.insert(ShaderHandle::from_raw(1), 0).unwrap();
        let minted = table.insert_next(9);
        assert_ne!(minted, ShaderHandle::from_raw(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn debug_format_shows_hex() {
        assert_eq!(format!("{:?}", ShaderHandle::from_raw(255)), "ShaderHandle(0xff)");
    }
}
