mod sizer;

pub use sizer::*;
