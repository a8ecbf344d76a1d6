pub mod constraint;
pub mod ids;
pub mod model;
pub mod params;
