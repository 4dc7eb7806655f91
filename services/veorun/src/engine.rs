//! Dynamic loader operations and the C-ABI call engine. Loader handles
//! and function addresses travel to the client as opaque u64 values and
//! come back unchanged; this module is the only place they are turned
//! back into pointers.

use libffi::middle::{Arg as FfiArg, Cif, CodePtr, Type};
use libloading::os::unix::{Library, RTLD_LAZY};
use std::cmp;
use std::mem::ManuallyDrop;
use std::os::raw::c_void;
use veowire::args::{Arg, CopyDescriptor};
use veowire::logging::{self, Logger};

/// Open `libname` with lazy binding. Zero when the library cannot be
/// opened.
pub fn load_library(libname: &str, log: &Logger) -> u64 {
    match unsafe { Library::open(Some(libname), RTLD_LAZY) } {
        Ok(lib) => lib.into_raw() as u64,
        Err(err) => {
            logging::warn!(log, "cannot open library"; "libname" => libname, "error" => %err);
            0
        }
    }
}

/// Close a loader handle. Zero on success, mirroring the loader's own
/// convention.
pub fn unload_library(libhdl: u64) -> u64 {
    if libhdl == 0 {
        return 1;
    }

    let lib = unsafe { Library::from_raw(libhdl as *mut c_void) };

    match lib.close() {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Resolve `symname` in a loader handle without closing it. Zero when
/// the symbol is missing.
pub fn get_sym(libhdl: u64, symname: &str, log: &Logger) -> u64 {
    if libhdl == 0 {
        return 0;
    }

    let lib = ManuallyDrop::new(unsafe { Library::from_raw(libhdl as *mut c_void) });

    match unsafe { lib.get::<*mut c_void>(symname.as_bytes()) } {
        Ok(sym) => sym.into_raw() as u64,
        Err(err) => {
            logging::debug!(log, "symbol not found"; "symname" => symname, "error" => %err);
            0
        }
    }
}

/// Invoke the function at `fn_addr` with the platform C ABI, passing the
/// typed slots in order, and return its unsigned 64-bit result word
/// together with the filled copy-out descriptors.
///
/// Every stack slot gets a call-scoped buffer. In-directed slots consume
/// the next copy-in descriptor before the call and out-directed slots
/// fill the next copy-out descriptor after it, both in argument-index
/// order; the callee sees the buffer's address in the slot position.
pub fn call(
    fn_addr: u64,
    args: &[Arg],
    copy_in: &[CopyDescriptor],
    mut copy_out: Vec<CopyDescriptor>,
) -> (u64, Vec<CopyDescriptor>) {
    if fn_addr == 0 {
        return (0, copy_out);
    }

    let stack_count = args
        .iter()
        .filter(|arg| match arg {
            Arg::Stack(_) => true,
            _ => false,
        })
        .count();

    // Preallocated so the addresses handed to libffi stay put.
    let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(stack_count);
    let mut buffer_ptrs: Vec<*mut c_void> = Vec::with_capacity(stack_count);
    let mut copy_in_slots = copy_in.iter();

    let mut types = Vec::with_capacity(args.len());
    let mut values = Vec::with_capacity(args.len());

    for arg in args {
        match arg {
            Arg::I64(val) => {
                types.push(Type::i64());
                values.push(FfiArg::new(val));
            }
            Arg::U64(val) => {
                types.push(Type::u64());
                values.push(FfiArg::new(val));
            }
            Arg::I32(val) => {
                types.push(Type::i32());
                values.push(FfiArg::new(val));
            }
            Arg::U32(val) => {
                types.push(Type::u32());
                values.push(FfiArg::new(val));
            }
            Arg::I16(val) => {
                types.push(Type::i16());
                values.push(FfiArg::new(val));
            }
            Arg::U16(val) => {
                types.push(Type::u16());
                values.push(FfiArg::new(val));
            }
            Arg::I8(val) => {
                types.push(Type::i8());
                values.push(FfiArg::new(val));
            }
            Arg::U8(val) => {
                types.push(Type::u8());
                values.push(FfiArg::new(val));
            }
            Arg::Double(val) => {
                types.push(Type::f64());
                values.push(FfiArg::new(val));
            }
            Arg::Float(val) => {
                types.push(Type::f32());
                values.push(FfiArg::new(val));
            }
            Arg::Stack(stack) => {
                let mut buffer = vec![0u8; stack.len as usize];

                if stack.intent.is_in() {
                    if let Some(desc) = copy_in_slots.next() {
                        let count = cmp::min(desc.data.len(), buffer.len());
                        buffer[..count].copy_from_slice(&desc.data[..count]);
                    }
                }

                buffers.push(buffer);
                let ptr = buffers.last_mut().expect("buffer just pushed").as_mut_ptr();
                buffer_ptrs.push(ptr as *mut c_void);

                types.push(Type::pointer());
                values.push(FfiArg::new(&buffer_ptrs[buffer_ptrs.len() - 1]));
            }
        }
    }

    let cif = Cif::new(types.into_iter(), Type::u64());
    let result: u64 = unsafe { cif.call(CodePtr(fn_addr as *mut _), &values) };

    // Capture out-directed buffers, again in argument-index order.
    let mut out_slots = copy_out.iter_mut();
    let mut call_buffers = buffers.iter();

    for arg in args {
        if let Arg::Stack(stack) = arg {
            let buffer = call_buffers.next().expect("one buffer per stack slot");

            if stack.intent.is_out() {
                if let Some(desc) = out_slots.next() {
                    desc.data.clear();
                    desc.data.extend_from_slice(buffer);
                }
            }
        }
    }

    (result, copy_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veowire::args::{Intent, StackArg};
    use veowire::logging::{o, Discard, Logger};

    extern "C" fn increment(x: u64) -> u64 {
        x + 1
    }

    extern "C" fn blend(a: i8, b: u16, c: i32, d: i64, e: f32, f: f64) -> u64 {
        (i64::from(a) + i64::from(b) + i64::from(c) + d + e as i64 + f as i64) as u64
    }

    unsafe extern "C" fn add1(a: *const i32, b: *const i32) -> u64 {
        (*a + *b) as u64
    }

    unsafe extern "C" fn add2(sum: *mut i32, a: *const i32, b: *const i32) -> u64 {
        *sum = *a + *b;
        0
    }

    unsafe extern "C" fn add3(sum: *mut i32, a: *const i32) -> u64 {
        *sum += *a;
        0
    }

    fn discard() -> Logger {
        Logger::root(Discard, o!())
    }

    fn in_descriptor(val: i32) -> CopyDescriptor {
        CopyDescriptor {
            ve_ptr: 0,
            vh_ptr: 0,
            len: 4,
            data: val.to_ne_bytes().to_vec(),
        }
    }

    fn out_descriptor(len: u64) -> CopyDescriptor {
        CopyDescriptor {
            ve_ptr: 0,
            vh_ptr: 0,
            len,
            data: Vec::new(),
        }
    }

    fn stack_slot(intent: Intent, len: u64) -> Arg {
        Arg::Stack(StackArg {
            intent,
            buff: 0,
            len,
        })
    }

    #[test]
    fn test_scalar_call() {
        let fn_ptr: extern "C" fn(u64) -> u64 = increment;

        let (result, copy_out) = call(fn_ptr as usize as u64, &[Arg::U64(41)], &[], Vec::new());

        assert_eq!(result, 42);
        assert!(copy_out.is_empty());
    }

    #[test]
    fn test_all_scalar_kinds_marshalled() {
        let fn_ptr: extern "C" fn(i8, u16, i32, i64, f32, f64) -> u64 = blend;

        let args = [
            Arg::I8(-1),
            Arg::U16(2),
            Arg::I32(30),
            Arg::I64(400),
            Arg::Float(5.0),
            Arg::Double(6.0),
        ];

        let (result, _) = call(fn_ptr as usize as u64, &args, &[], Vec::new());

        assert_eq!(result, 442);
    }

    #[test]
    fn test_in_stack_args() {
        let fn_ptr: unsafe extern "C" fn(*const i32, *const i32) -> u64 = add1;

        let args = [stack_slot(Intent::In, 4), stack_slot(Intent::In, 4)];
        let copy_in = [in_descriptor(123), in_descriptor(456)];

        let (result, copy_out) = call(fn_ptr as usize as u64, &args, &copy_in, Vec::new());

        assert_eq!(result, 579);
        assert!(copy_out.is_empty());
    }

    #[test]
    fn test_out_stack_arg_captured() {
        let fn_ptr: unsafe extern "C" fn(*mut i32, *const i32, *const i32) -> u64 = add2;

        let args = [
            stack_slot(Intent::Out, 4),
            stack_slot(Intent::In, 4),
            stack_slot(Intent::In, 4),
        ];
        let copy_in = [in_descriptor(123), in_descriptor(456)];
        let copy_out = vec![out_descriptor(4)];

        let (result, copy_out) = call(fn_ptr as usize as u64, &args, &copy_in, copy_out);

        assert_eq!(result, 0);
        assert_eq!(copy_out.len(), 1);
        assert_eq!(copy_out[0].data, 579i32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_inout_stack_arg_roundtrip() {
        let fn_ptr: unsafe extern "C" fn(*mut i32, *const i32) -> u64 = add3;

        let args = [stack_slot(Intent::InOut, 4), stack_slot(Intent::In, 4)];
        let copy_in = [in_descriptor(1000), in_descriptor(23)];
        let copy_out = vec![out_descriptor(4)];

        let (result, copy_out) = call(fn_ptr as usize as u64, &args, &copy_in, copy_out);

        assert_eq!(result, 0);
        assert_eq!(copy_out[0].data, 1023i32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_mixed_scalar_and_stack_positions() {
        unsafe extern "C" fn scale(factor: i32, value: *mut i32) -> u64 {
            *value *= factor;
            0
        }

        let fn_ptr: unsafe extern "C" fn(i32, *mut i32) -> u64 = scale;

        let args = [Arg::I32(3), stack_slot(Intent::InOut, 4)];
        let copy_in = [in_descriptor(14)];
        let copy_out = vec![out_descriptor(4)];

        let (_, copy_out) = call(fn_ptr as usize as u64, &args, &copy_in, copy_out);

        assert_eq!(copy_out[0].data, 42i32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_null_address_is_a_zero_result() {
        let (result, copy_out) = call(0, &[Arg::I32(1)], &[], vec![out_descriptor(4)]);

        assert_eq!(result, 0);
        assert_eq!(copy_out[0].data, Vec::<u8>::new());
    }

    #[test]
    fn test_loader_failures_are_zero_sentinels() {
        let log = discard();

        assert_eq!(load_library("/nonexistent/libnothing.so", &log), 0);
        assert_eq!(get_sym(0, "anything", &log), 0);
        assert_ne!(unload_library(0), 0);
    }
}
