pub mod encoder;
pub mod value;

pub use encoder::{BincodeEncoder, Encoder};
pub use value::{compare_values, natural_order, value_order, Comparator, Value};
