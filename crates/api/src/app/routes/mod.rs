pub mod session;
pub mod system;
