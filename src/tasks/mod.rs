pub(crate) mod grading;
pub(crate) mod maintenance;
pub(crate) mod scheduler;
