pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod evaluations;
pub mod results;
pub mod scores;
pub mod students;
pub mod subjects;
