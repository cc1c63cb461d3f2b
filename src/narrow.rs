
/// Conversions between the integer shapes the crate mixes: buffer offsets are `usize`,
///  wire fields are `u32`, and the ack counters are `i32` to leave room for the -1
///  pre-connect sentinel. The protocol keeps every one of these values below 2^31, so
///  the conversions can never truncate - the panic only fires if that bound was broken
///  upstream, which is corrupted state rather than anything a caller could recover from.
pub trait NarrowCast<T> {
    fn narrow(self) -> T;
}

impl NarrowCast<u32> for usize {
    fn narrow(self) -> u32 {
        self.try_into().expect("offset escaped the 2^31 wire bound")
    }
}

impl NarrowCast<i32> for usize {
    fn narrow(self) -> i32 {
        self.try_into().expect("offset escaped the 2^31 wire bound")
    }
}

impl NarrowCast<i32> for u32 {
    fn narrow(self) -> i32 {
        self.try_into().expect("offset escaped the 2^31 wire bound")
    }
}

impl NarrowCast<usize> for i32 {
    fn narrow(self) -> usize {
        self.try_into().expect("offset escaped the 2^31 wire bound")
    }
}
