pub mod builder;
pub mod period;
pub mod window;
