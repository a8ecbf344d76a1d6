pub mod graph;
pub mod inventory;
pub mod run;
