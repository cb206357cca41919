pub mod building;
pub mod running;
