pub mod apply;
pub mod credentials;
pub mod retry;
pub mod rosa;
