use std::io;
use std::io::ErrorKind::WouldBlock;

/// Adapter collapsing `WouldBlock` into "no progress" so handler code can
/// treat back-pressure as a zero byte count.
pub trait NoBlock {
    type Value;

    fn no_block(self) -> io::Result<Self::Value>;
}

impl NoBlock for io::Result<usize> {
    type Value = usize;

    fn no_block(self) -> io::Result<Self::Value> {
        match self {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }
}
