pub mod gpu;
pub mod ports;
