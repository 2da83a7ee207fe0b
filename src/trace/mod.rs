pub mod io;
pub mod phase;
pub mod sink;
