mod assembler;
mod config;
mod encoder;

pub use assembler::WindowAssembler;
pub use config::{stream_width, WindowConfig};
pub use encoder::VectorEncoder;
