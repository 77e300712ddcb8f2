pub mod matrix;
pub mod ukf;

pub mod ahrs;
pub mod align;
pub mod attitude;
pub mod filter;
