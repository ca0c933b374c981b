pub mod constraints;
pub mod filter;
pub mod relational_db;
pub mod relational_operators;
pub mod system_tables;
pub mod table;
pub mod transaction;
pub mod trigger;
