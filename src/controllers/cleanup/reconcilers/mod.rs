pub mod hosting;
pub mod sweep;
