mod decoder;
mod encoder;
mod value;

pub use value::Value;
