mod controller;
mod executor;
mod trading_loop;

pub use controller::*;
pub use executor::*;
pub use trading_loop::*;
