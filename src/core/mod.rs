pub mod io;
pub mod range;

pub use io::*;
pub use range::*;
