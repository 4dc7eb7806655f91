use std::os::raw::c_void;
use std::ptr;
use std::slice;
use veowire::args::CopyDescriptor;

/// Allocate `size` bytes on the worker heap. The address travels to the
/// client as an opaque u64; zero means the allocation failed.
pub fn alloc(size: u64) -> u64 {
    unsafe { libc::malloc(size as usize) as u64 }
}

/// Release memory obtained from `alloc`.
pub fn free(addr: u64) {
    if addr != 0 {
        unsafe { libc::free(addr as *mut c_void) };
    }
}

/// Copy `size` bytes out of worker memory at `src`.
pub fn read(src: u64, size: u64) -> Vec<u8> {
    if src == 0 || size == 0 {
        return Vec::new();
    }

    unsafe { slice::from_raw_parts(src as *const u8, size as usize) }.to_vec()
}

/// Copy `data` into worker memory at `dst`.
pub fn write(dst: u64, data: &[u8]) {
    if dst == 0 || data.is_empty() {
        return;
    }

    unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len()) };
}

/// Fill each descriptor's payload from the worker range it names.
pub fn read_descriptors(mut descriptors: Vec<CopyDescriptor>) -> Vec<CopyDescriptor> {
    for desc in descriptors.iter_mut() {
        desc.data = read(desc.ve_ptr, desc.len);
    }

    descriptors
}

/// Write each descriptor's payload into the worker range it names.
pub fn write_descriptors(descriptors: &[CopyDescriptor]) {
    for desc in descriptors {
        write(desc.ve_ptr, &desc.data);
    }
}
