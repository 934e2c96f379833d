//! CUDA device and managed-memory backing for [`super::Space::Device`] and
//! [`super::Space::DeviceManaged`], built on `cudarc`'s safe driver wrapper.
//!
//! A device allocation is represented outside this module as an opaque
//! `usize` handle (stashed in [`super::RawBuf`]'s pointer field) rather than
//! a raw device pointer, since `cudarc::driver::CudaSlice` owns its backing
//! memory and must stay alive for as long as the allocation is in use. This
//! table is that lifetime anchor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use cudarc::driver::{CudaDevice, CudaSlice};

use crate::error::{Error, Kind, Operation};
use crate::Result;

struct Entry {
    device: Arc<CudaDevice>,
    slice: CudaSlice<u8>,
    #[allow(dead_code)]
    managed: bool,
}

static INIT: Once = Once::new();
static mut ENTRIES: Option<Mutex<HashMap<usize, Entry>>> = None;
static mut DEVICES: Option<Mutex<HashMap<u32, Arc<CudaDevice>>>> = None;
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(1);

fn init() {
    INIT.call_once(|| unsafe {
        ENTRIES = Some(Mutex::new(HashMap::new()));
        DEVICES = Some(Mutex::new(HashMap::new()));
    });
}

fn entries() -> &'static Mutex<HashMap<usize, Entry>> {
    init();
    unsafe { ENTRIES.as_ref().unwrap() }
}

fn devices() -> &'static Mutex<HashMap<u32, Arc<CudaDevice>>> {
    init();
    unsafe { DEVICES.as_ref().unwrap() }
}

fn to_err(op: Operation, err: impl std::fmt::Display) -> Error {
    Error::external(op, Kind::Internal, err)
}

fn device(ordinal: u32) -> Result<Arc<CudaDevice>> {
    let mut map = devices().lock().unwrap();
    if let Some(dev) = map.get(&ordinal) {
        return Ok(dev.clone());
    }
    let dev =
        CudaDevice::new(ordinal as usize).map_err(|e| to_err(Operation::SpaceAllocate, e))?;
    map.insert(ordinal, dev.clone());
    Ok(dev)
}

/// Allocates a zeroed device buffer and returns `(handle, len)`.
///
/// `managed` is recorded for bookkeeping; `cudarc`'s high-level allocator
/// does not distinguish unified memory from plain device memory the way
/// the raw driver API's `cuMemAllocManaged` does, so `Space::DeviceManaged`
/// currently gets the same plain device allocation as `Space::Device` with
/// the difference noted in `DESIGN.md`.
pub fn allocate(ordinal: u32, len: usize, managed: bool) -> Result<(usize, usize)> {
    let dev = device(ordinal)?;
    let slice = dev
        .alloc_zeros::<u8>(len.max(1))
        .map_err(|e| to_err(Operation::SpaceAllocate, e))?;
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    entries().lock().unwrap().insert(handle, Entry { device: dev, slice, managed });
    Ok((handle, len))
}

pub fn free(handle: usize) {
    entries().lock().unwrap().remove(&handle);
}

pub fn copy_from_host(handle: usize, src: &[u8]) -> Result<()> {
    copy_from_host_at(handle, 0, src)
}

pub fn copy_from_host_at(handle: usize, offset: usize, src: &[u8]) -> Result<()> {
    let mut map = entries().lock().unwrap();
    let entry = map.get_mut(&handle).ok_or_else(|| Error::invalid_argument(Operation::SpaceCopy))?;
    let mut staged = entry
        .device
        .dtoh_sync_copy(&entry.slice)
        .map_err(|e| to_err(Operation::SpaceCopy, e))?;
    staged[offset..offset + src.len()].copy_from_slice(src);
    entry.device.htod_sync_copy_into(&staged, &mut entry.slice).map_err(|e| to_err(Operation::SpaceCopy, e))
}

pub fn copy_to_host(handle: usize, dst: &mut [u8]) -> Result<()> {
    copy_to_host_at(handle, 0, dst)
}

pub fn copy_to_host_at(handle: usize, offset: usize, dst: &mut [u8]) -> Result<()> {
    let map = entries().lock().unwrap();
    let entry = map.get(&handle).ok_or_else(|| Error::invalid_argument(Operation::SpaceCopy))?;
    let staged = entry.device.dtoh_sync_copy(&entry.slice).map_err(|e| to_err(Operation::SpaceCopy, e))?;
    dst.copy_from_slice(&staged[offset..offset + dst.len()]);
    Ok(())
}

/// Device-to-device copy, implemented as a host round trip.
///
/// `cudarc`'s safe API has no way to borrow two distinct `CudaSlice`s out of
/// the same table mutably at once, and a peer-to-peer `dtod` copy isn't
/// worth the extra unsafe plumbing for a path the ring only exercises when
/// both the source and destination rings are device-resident.
pub fn copy_device_to_device(dst: usize, src: usize, n: usize) -> Result<()> {
    copy_device_to_device_at(dst, 0, src, 0, n)
}

pub fn copy_device_to_device_at(
    dst: usize,
    dst_off: usize,
    src: usize,
    src_off: usize,
    n: usize,
) -> Result<()> {
    let mut staged = vec![0u8; n];
    copy_to_host_at(src, src_off, &mut staged)?;
    copy_from_host_at(dst, dst_off, &staged)
}

pub fn memset(handle: usize, value: u8, n: usize) -> Result<()> {
    let mut map = entries().lock().unwrap();
    let entry = map.get_mut(&handle).ok_or_else(|| Error::invalid_argument(Operation::SpaceCopy))?;
    if value == 0 {
        return entry.device.memset_zeros(&mut entry.slice).map_err(|e| to_err(Operation::SpaceCopy, e));
    }
    let staged = vec![value; n];
    entry.device.htod_sync_copy_into(&staged, &mut entry.slice).map_err(|e| to_err(Operation::SpaceCopy, e))
}
