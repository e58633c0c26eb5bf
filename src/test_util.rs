pub mod assets;
pub mod network;
