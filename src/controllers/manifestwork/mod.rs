pub mod controller;

pub use controller::run;

pub(crate) mod reconcilers;
