use veowire::args::{Arg, CopyDescriptor, Intent, StackArg};

/// Ordered, positional argument list for an offloaded call. Setting a slot
/// beyond the current length grows the list; intermediate slots default to
/// a zero word until they are set.
#[derive(Debug, Clone, Default)]
pub struct ArgList {
    slots: Vec<Arg>,
}

impl ArgList {
    #[inline]
    pub fn new() -> ArgList {
        ArgList::default()
    }

    /// Remove all slots so the list can be reused for another call.
    #[inline]
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slots in argument-index order.
    #[inline]
    pub fn slots(&self) -> &[Arg] {
        &self.slots
    }

    pub fn set_i64(&mut self, argnum: usize, val: i64) {
        self.set(argnum, Arg::I64(val));
    }

    pub fn set_u64(&mut self, argnum: usize, val: u64) {
        self.set(argnum, Arg::U64(val));
    }

    pub fn set_i32(&mut self, argnum: usize, val: i32) {
        self.set(argnum, Arg::I32(val));
    }

    pub fn set_u32(&mut self, argnum: usize, val: u32) {
        self.set(argnum, Arg::U32(val));
    }

    pub fn set_i16(&mut self, argnum: usize, val: i16) {
        self.set(argnum, Arg::I16(val));
    }

    pub fn set_u16(&mut self, argnum: usize, val: u16) {
        self.set(argnum, Arg::U16(val));
    }

    pub fn set_i8(&mut self, argnum: usize, val: i8) {
        self.set(argnum, Arg::I8(val));
    }

    pub fn set_u8(&mut self, argnum: usize, val: u8) {
        self.set(argnum, Arg::U8(val));
    }

    pub fn set_double(&mut self, argnum: usize, val: f64) {
        self.set(argnum, Arg::Double(val));
    }

    pub fn set_float(&mut self, argnum: usize, val: f32) {
        self.set(argnum, Arg::Float(val));
    }

    /// Bind `len` bytes at `buff` as an indirect argument in slot
    /// `argnum`. The callee receives a pointer; the bytes are shuttled to
    /// the worker before the call and, for out-directed intents, back into
    /// `buff` before the call's result becomes observable.
    ///
    /// # Safety
    ///
    /// `buff` must point to at least `len` bytes that stay valid (and
    /// writable for out-directed intents) until the result of the call
    /// using this list has been consumed.
    pub unsafe fn set_stack(&mut self, intent: Intent, argnum: usize, buff: *mut u8, len: usize) {
        self.set(
            argnum,
            Arg::Stack(StackArg {
                intent,
                buff: buff as u64,
                len: len as u64,
            }),
        );
    }

    #[inline]
    fn set(&mut self, argnum: usize, arg: Arg) {
        if self.slots.len() <= argnum {
            self.slots.resize(argnum + 1, Arg::U64(0));
        }

        self.slots[argnum] = arg;
    }

    /// Build the request-side copy descriptor lists. Within each list the
    /// entries pair up with the stack slots of the matching direction in
    /// argument-index order; the worker consumes them in the same order.
    pub(crate) fn copy_descriptors(
        &self,
    ) -> (Option<Vec<CopyDescriptor>>, Option<Vec<CopyDescriptor>>) {
        let mut copy_in = Vec::new();
        let mut copy_out = Vec::new();

        for arg in &self.slots {
            if let Arg::Stack(ref stack) = arg {
                let descriptor = CopyDescriptor {
                    ve_ptr: 0,
                    vh_ptr: stack.buff,
                    len: stack.len,
                    data: Vec::new(),
                };

                if stack.intent.is_in() {
                    copy_in.push(descriptor.clone());
                }
                if stack.intent.is_out() {
                    copy_out.push(descriptor);
                }
            }
        }

        let fold = |list: Vec<CopyDescriptor>| {
            if list.is_empty() {
                None
            } else {
                Some(list)
            }
        };

        (fold(copy_in), fold(copy_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_set_grows_list() {
        let mut args = ArgList::new();
        args.set_i32(2, 7);

        assert_eq!(args.len(), 3);
        assert_eq!(args.slots()[0], Arg::U64(0));
        assert_eq!(args.slots()[2], Arg::I32(7));

        args.set_double(0, 1.5);

        assert_eq!(args.len(), 3);
        assert_eq!(args.slots()[0], Arg::Double(1.5));
    }

    #[test]
    fn test_clear_resets_slots() {
        let mut args = ArgList::new();
        args.set_u8(0, 1);
        args.clear();

        assert!(args.is_empty());
    }

    #[test]
    fn test_copy_descriptors_pair_with_stack_slots() {
        let mut sum = 0i32;
        let mut a = 123i32;

        let mut args = ArgList::new();
        unsafe {
            args.set_stack(Intent::Out, 0, &mut sum as *mut i32 as *mut u8, 4);
            args.set_i32(1, 5);
            args.set_stack(Intent::InOut, 2, &mut a as *mut i32 as *mut u8, 4);
        }

        let (copy_in, copy_out) = args.copy_descriptors();
        let copy_in = copy_in.unwrap();
        let copy_out = copy_out.unwrap();

        // Only the in-out slot travels in; both stack slots travel out,
        // ordered by argument index.
        assert_eq!(copy_in.len(), 1);
        assert_eq!(copy_in[0].vh_ptr, &mut a as *mut i32 as u64);
        assert_eq!(copy_out.len(), 2);
        assert_eq!(copy_out[0].vh_ptr, &mut sum as *mut i32 as u64);
        assert_eq!(copy_out[1].vh_ptr, &mut a as *mut i32 as u64);
    }

    #[test]
    fn test_scalar_only_list_has_no_descriptors() {
        let mut args = ArgList::new();
        args.set_i32(0, 1);
        args.set_float(1, 2.0);

        let (copy_in, copy_out) = args.copy_descriptors();

        assert_eq!(copy_in, None);
        assert_eq!(copy_out, None);
    }
}
