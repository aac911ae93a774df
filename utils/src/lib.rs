pub use httprange::{ByteRange, InvalidRange};
pub use locker::{PathGuard, PathLocker};

pub mod httprange;
pub mod locker;
