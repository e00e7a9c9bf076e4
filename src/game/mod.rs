pub mod hazard;
pub mod play;
pub mod world;
