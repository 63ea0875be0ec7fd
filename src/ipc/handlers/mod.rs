pub mod attendance;
pub mod core;
pub mod courses;
pub mod dashboard;
pub mod grading;
pub mod reports;
pub mod scales;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod teachers;
