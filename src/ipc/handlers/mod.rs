pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod exams;
pub mod marks;
pub mod public_verify;
pub mod results;
pub mod school;
pub mod students;
pub mod subjects;
