pub mod equivalency;
pub mod value;
