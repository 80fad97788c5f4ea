pub mod identifier;
pub mod location_table;
pub mod storage;
