pub mod runner;
pub mod transport;
